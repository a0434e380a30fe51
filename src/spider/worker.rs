use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crossbeam_channel::{Receiver, Sender, SendTimeoutError};
use crate::plugins::Plugin;
use super::record::utcnow;
use super::{ConnRecord, Job, JobMsg, ResMsg, QUEUE_SLEEP};

/// Everything a worker thread needs. The running flag gates every
/// blocking operation; stopping distinguishes an orderly drain from a
/// fast teardown.
pub struct WorkerCtx {
    pub plugin:   Arc<dyn Plugin>,
    pub jobs:     Receiver<JobMsg>,
    pub results:  Sender<ResMsg>,
    pub running:  Arc<AtomicBool>,
    pub stopping: Arc<AtomicBool>,
    pub active:   Arc<AtomicUsize>,
}

pub fn connect_wrapper(plugin: &dyn Plugin, job: &Job, config: usize) -> ConnRecord {
    let start = utcnow();
    let mut rec = plugin.connect(job, config);
    rec.spdr_start = start;
    rec
}

/// Run the post-connect hooks, stamp and ship the records. The job
/// itself goes first so the combiner knows it before any record
/// arrives. Returns false if shutdown interrupted the send.
pub fn finalise_conns(ctx: &WorkerCtx, job: &Job, id: &str, mut conns: Vec<ConnRecord>) -> bool {
    for (config, rec) in conns.iter_mut().enumerate() {
        ctx.plugin.post_connect(job, rec, config);
    }

    if !send_result(ctx, ResMsg::Job(id.to_owned(), job.clone())) {
        return false;
    }

    for (config, mut rec) in conns.into_iter().enumerate() {
        rec.spdr_stop = utcnow();
        rec.config = config;
        rec.dip = job.dip.clone();
        rec.dp = job.dp;
        rec.job_id = id.to_owned();

        if !send_result(ctx, ResMsg::Conn(rec)) {
            return false;
        }
    }

    true
}

/// Blocking send on the bounded result queue, polling the running flag
/// so backpressure never outlives a shutdown.
pub fn send_result(ctx: &WorkerCtx, msg: ResMsg) -> bool {
    let mut msg = msg;
    loop {
        match ctx.results.send_timeout(msg, QUEUE_SLEEP) {
            Ok(())                               => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if !ctx.running.load(Ordering::Acquire) {
                    return false;
                }
                msg = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
