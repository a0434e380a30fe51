use std::sync::atomic::Ordering;
use std::thread;
use anyhow::Result;
use crossbeam_channel::TryRecvError;
use log::debug;
use super::record::ConnState;
use super::worker::{connect_wrapper, finalise_conns, WorkerCtx};
use super::{next_job_id, Job, JobMsg, QUEUE_SLEEP};

/// Worker loop for desynchronized and forge plugins: the probe variant
/// is encoded in the connection or the packet itself, so the attempts
/// for one job run back to back with no cross-worker rendezvous.
pub fn worker(ctx: WorkerCtx, count: usize, number: usize) -> Result<()> {
    let mut active = true;

    while ctx.running.load(Ordering::Acquire) {
        if active {
            match ctx.jobs.try_recv() {
                Ok(JobMsg::Job(job)) => {
                    debug!("worker {} got a job: {}:{}", number, job.dip, job.dp);
                    if !run_job(&ctx, count, job) {
                        return Ok(());
                    }
                }
                Ok(JobMsg::Shutdown) => {
                    debug!("shutting down worker {} on sentinel", number);
                    active = false;
                    let left = ctx.active.fetch_sub(1, Ordering::SeqCst) - 1;
                    debug!("{} workers still active", left);
                }
                Err(TryRecvError::Empty)        => thread::sleep(QUEUE_SLEEP),
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        } else if ctx.stopping.load(Ordering::Acquire) {
            return Ok(());
        } else {
            thread::sleep(QUEUE_SLEEP);
        }
    }

    Ok(())
}

fn run_job(ctx: &WorkerCtx, count: usize, job: Job) -> bool {
    let id = next_job_id();

    ctx.plugin.pre_connect(&job);

    let mut conns = Vec::with_capacity(count);
    let mut discard = false;

    for config in 0..count {
        let rec = connect_wrapper(&*ctx.plugin, &job, config);
        discard = discard || rec.spdr_state == ConnState::Discard;
        conns.push(rec);
    }

    if discard {
        debug!("job for {} discarded", job.dip);
        return true;
    }

    let ok = finalise_conns(ctx, &job, &id, conns);
    debug!("job complete: {}", job.dip);
    ok
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use crossbeam_channel::bounded;
    use crate::observer::Chain;
    use crate::plugins::{Mode, Plugin};
    use crate::spider::worker::WorkerCtx;
    use crate::spider::{ConnRecord, ConnState, Job, JobMsg, MergedRecord, ResMsg};

    struct Probe;

    impl Plugin for Probe {
        fn name(&self) -> &'static str { "probe" }
        fn mode(&self) -> Mode { Mode::Desynchronized }
        fn count(&self) -> usize { 2 }
        fn chains(&self) -> Vec<Box<dyn Chain>> { vec![] }
        fn connect(&self, _job: &Job, config: usize) -> ConnRecord {
            match config {
                0 => ConnRecord::new(40000, ConnState::Ok),
                _ => ConnRecord::new(40001, ConnState::Timeout),
            }
        }
        fn combine_flows(&self, _: &[MergedRecord]) -> Option<Vec<String>> {
            None
        }
    }

    struct Discarder;

    impl Plugin for Discarder {
        fn name(&self) -> &'static str { "discarder" }
        fn mode(&self) -> Mode { Mode::Desynchronized }
        fn count(&self) -> usize { 2 }
        fn chains(&self) -> Vec<Box<dyn Chain>> { vec![] }
        fn connect(&self, _job: &Job, config: usize) -> ConnRecord {
            match config {
                0 => ConnRecord::new(40000, ConnState::Ok),
                _ => ConnRecord::new(0, ConnState::Discard),
            }
        }
        fn combine_flows(&self, _: &[MergedRecord]) -> Option<Vec<String>> {
            None
        }
    }

    fn run_one(plugin: Arc<dyn Plugin>) -> Vec<ResMsg> {
        let (jtx, jrx) = bounded(8);
        let (rtx, rrx) = bounded(8);

        let running = Arc::new(AtomicBool::new(true));
        let ctx = WorkerCtx {
            plugin:   plugin,
            jobs:     jrx,
            results:  rtx,
            running:  running.clone(),
            stopping: Arc::new(AtomicBool::new(true)),
            active:   Arc::new(AtomicUsize::new(1)),
        };

        jtx.send(JobMsg::Job(Job::new("192.0.2.1", 80))).unwrap();
        jtx.send(JobMsg::Shutdown).unwrap();

        let handle = thread::spawn(move || super::worker(ctx, 2, 0));
        handle.join().unwrap().unwrap();

        let mut out = Vec::new();
        while let Ok(msg) = rrx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn records_stamped_in_config_order() {
        let out = run_one(Arc::new(Probe));
        assert_eq!(out.len(), 3);

        match &out[0] {
            ResMsg::Job(_, job) => assert_eq!(job.dip, "192.0.2.1"),
            _                   => panic!("job registration must come first"),
        }

        for (i, msg) in out[1..].iter().enumerate() {
            match msg {
                ResMsg::Conn(rec) => {
                    assert_eq!(rec.config, i);
                    assert_eq!(rec.dip, "192.0.2.1");
                    assert_eq!(rec.dp, 80);
                    assert!(!rec.spdr_start.is_empty());
                    assert!(rec.spdr_start <= rec.spdr_stop);
                }
                _ => panic!("expected a connection record"),
            }
        }
    }

    #[test]
    fn discard_suppresses_whole_job() {
        let out = run_one(Arc::new(Discarder));
        assert!(out.is_empty());
    }
}
