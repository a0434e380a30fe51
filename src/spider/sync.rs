use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use anyhow::Result;
use crossbeam_channel::TryRecvError;
use log::debug;
use crate::plugins::Plugin;
use super::record::ConnState;
use super::semaphore::SemaphoreN;
use super::worker::{connect_wrapper, finalise_conns, WorkerCtx};
use super::{next_job_id, Job, JobMsg, QUEUE_SLEEP};

/// The barrier the configurator drives all workers through: one
/// (go, done) semaphore pair per configuration, each holding up to one
/// token per worker. A connection under configuration c can only start
/// after the configurator released go[c], and the configurator cannot
/// move past c until every worker released done[(c+1) mod N].
pub struct Rendezvous {
    go:      Vec<SemaphoreN>,
    done:    Vec<SemaphoreN>,
    configs: usize,
    workers: usize,
}

impl Rendezvous {
    pub fn new(configs: usize, workers: usize) -> Self {
        Self {
            go:      (0..configs).map(|_| SemaphoreN::new()).collect(),
            done:    (0..configs).map(|_| SemaphoreN::new()).collect(),
            configs: configs,
            workers: workers,
        }
    }
}

struct Teardown(Arc<dyn Plugin>);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

/// One thread alternating the process-wide state between the plugin's
/// configurations, in lockstep with every worker. Teardown runs on
/// every exit path, clean or not.
pub fn configurator(plugin: Arc<dyn Plugin>, rdv: Arc<Rendezvous>,
                    running: Arc<AtomicBool>) -> Result<()> {
    let teardown = Teardown(plugin.clone());

    'rounds: while running.load(Ordering::Acquire) {
        for config in 0..rdv.configs {
            debug!("setting config {}", config);
            plugin.configure(config)?;
            debug!("config {} active", config);

            rdv.go[config].release_n(rdv.workers);
            if !rdv.done[(config + 1) % rdv.configs].acquire_n(rdv.workers, &running) {
                break 'rounds;
            }
        }
    }

    // let workers still cycling run through to their exit check
    for config in 0..rdv.configs {
        rdv.go[config].release_n(rdv.workers);
    }

    drop(teardown);

    Ok(())
}

/// Worker loop for synchronized plugins. With a job in hand the worker
/// performs one connect per configuration inside the rendezvous; with
/// nothing to do it still cycles the semaphores so the configurator
/// never stalls on a thin job queue.
pub fn worker(ctx: WorkerCtx, rdv: Arc<Rendezvous>, number: usize) -> Result<()> {
    let mut active = true;

    while ctx.running.load(Ordering::Acquire) {
        if active {
            match ctx.jobs.try_recv() {
                Ok(JobMsg::Job(job)) => {
                    debug!("worker {} got a job: {}:{}", number, job.dip, job.dp);
                    if !run_job(&ctx, &rdv, job) {
                        return Ok(());
                    }
                }
                Ok(JobMsg::Shutdown) => {
                    debug!("shutting down worker {} on sentinel", number);
                    active = false;
                    let left = ctx.active.fetch_sub(1, Ordering::SeqCst) - 1;
                    debug!("{} workers still active", left);
                }
                Err(TryRecvError::Empty) => {
                    if !cycle(&ctx, &rdv) {
                        return Ok(());
                    }
                }
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        } else {
            for config in 0..rdv.configs {
                if !rdv.go[config].acquire(&ctx.running) {
                    return Ok(());
                }
                thread::sleep(QUEUE_SLEEP);
                if config == 0 && ctx.active.load(Ordering::SeqCst) == 0 {
                    return Ok(());
                }
                rdv.done[(config + 1) % rdv.configs].release();
            }
        }
    }

    Ok(())
}

fn cycle(ctx: &WorkerCtx, rdv: &Rendezvous) -> bool {
    for config in 0..rdv.configs {
        if !rdv.go[config].acquire(&ctx.running) {
            return false;
        }
        thread::sleep(QUEUE_SLEEP);
        rdv.done[(config + 1) % rdv.configs].release();
    }
    true
}

fn run_job(ctx: &WorkerCtx, rdv: &Rendezvous, job: Job) -> bool {
    let id = next_job_id();

    ctx.plugin.pre_connect(&job);

    let mut conns = Vec::with_capacity(rdv.configs);
    let mut discard = false;

    for config in 0..rdv.configs {
        if !rdv.go[config].acquire(&ctx.running) {
            return false;
        }

        let rec = connect_wrapper(&*ctx.plugin, &job, config);
        discard = discard || rec.spdr_state == ConnState::Discard;
        conns.push(rec);

        rdv.done[(config + 1) % rdv.configs].release();
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
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use parking_lot::Mutex;
    use super::*;

    /// Two fake workers and a configurator must interleave so that no
    /// connect for config c happens before the configurator applied c,
    /// and configurations strictly alternate per round.
    #[test]
    fn rendezvous_orders_rounds() {
        let rdv = Arc::new(Rendezvous::new(2, 2));
        let running = Arc::new(AtomicBool::new(true));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::new();
        for _ in 0..2 {
            let rdv = rdv.clone();
            let running = running.clone();
            let log = log.clone();
            workers.push(thread::spawn(move || {
                for _round in 0..3 {
                    for config in 0..2 {
                        assert!(rdv.go[config].acquire(&running));
                        log.lock().push(format!("connect{}", config));
                        rdv.done[(config + 1) % 2].release();
                    }
                }
            }));
        }

        let cfg = {
            let rdv = rdv.clone();
            let running = running.clone();
            let log = log.clone();
            thread::spawn(move || {
                for _round in 0..3 {
                    for config in 0..2 {
                        log.lock().push(format!("apply{}", config));
                        rdv.go[config].release_n(2);
                        assert!(rdv.done[(config + 1) % 2].acquire_n(2, &running));
                    }
                }
            })
        };

        for w in workers {
            w.join().unwrap();
        }
        cfg.join().unwrap();

        let log = log.lock();
        let mut applied = 0;
        for entry in log.iter() {
            match entry.as_str() {
                "apply0"   => applied = 0,
                "apply1"   => applied = 1,
                "connect0" => assert_eq!(applied, 0),
                "connect1" => assert_eq!(applied, 1),
                _          => unreachable!(),
            }
        }
        assert_eq!(log.iter().filter(|e| e.starts_with("apply")).count(), 6);
    }

    #[test]
    fn interrupted_rendezvous_unblocks() {
        let rdv = Arc::new(Rendezvous::new(2, 1));
        let running = Arc::new(AtomicBool::new(true));
        let active = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let rdv = rdv.clone();
            let running = running.clone();
            thread::spawn(move || rdv.go[0].acquire(&running))
        };

        running.store(false, Ordering::Release);
        assert!(!waiter.join().unwrap());
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
