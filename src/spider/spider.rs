use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender, SendTimeoutError};
use log::{debug, error, info};
use parking_lot::Mutex;
use crate::observer::{open_uri, run_enqueuer, Observer};
use crate::plugins::{Mode, Plugin};
use super::combiner::Combiner;
use super::merger::Merger;
use super::sync::{self, Rendezvous};
use super::worker::WorkerCtx;
use super::{desync, FlowMsg, Job, JobMsg, OutMsg, ResMsg, QUEUE_SIZE, QUEUE_SLEEP};

/// Owns the queues and threads of one measurement run: the observer,
/// the merger (running the combiner inline), the configurator where
/// the plugin wants one, and the worker pool. All hand-off between
/// components is by bounded queue.
pub struct Spider {
    plugin:  Arc<dyn Plugin>,
    workers: usize,
    uri:     String,

    running:  Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    obs_stop: Arc<AtomicBool>,
    failed:   Arc<AtomicBool>,
    active:   Arc<AtomicUsize>,

    jobs_tx: Sender<JobMsg>,
    jobs_rx: Receiver<JobMsg>,
    out_rx:  Receiver<OutMsg>,

    inner: Mutex<Inner>,
}

struct Inner {
    results_tx: Option<Sender<ResMsg>>,
    results_rx: Option<Receiver<ResMsg>>,
    flows_tx:   Option<Sender<FlowMsg>>,
    flows_rx:   Option<Receiver<FlowMsg>>,
    out_tx:     Option<Sender<OutMsg>>,

    workers:      Vec<JoinHandle<()>>,
    observer:     Option<JoinHandle<()>>,
    merger:       Option<JoinHandle<()>>,
    configurator: Option<JoinHandle<()>>,

    down: bool,
}

impl Spider {
    pub fn new(plugin: Arc<dyn Plugin>, workers: usize, uri: &str) -> Self {
        let (jobs_tx, jobs_rx) = bounded(QUEUE_SIZE);
        let (results_tx, results_rx) = bounded(QUEUE_SIZE);
        let (flows_tx, flows_rx) = bounded(QUEUE_SIZE);
        let (out_tx, out_rx) = bounded(QUEUE_SIZE);

        Self {
            plugin:   plugin,
            workers:  workers,
            uri:      uri.to_owned(),
            running:  Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            obs_stop: Arc::new(AtomicBool::new(false)),
            failed:   Arc::new(AtomicBool::new(false)),
            active:   Arc::new(AtomicUsize::new(0)),
            jobs_tx:  jobs_tx,
            jobs_rx:  jobs_rx,
            out_rx:   out_rx,
            inner:    Mutex::new(Inner {
                results_tx: Some(results_tx),
                results_rx: Some(results_rx),
                flows_tx:   Some(flows_tx),
                flows_rx:   Some(flows_rx),
                out_tx:     Some(out_tx),
                workers:      Vec::new(),
                observer:     None,
                merger:       None,
                configurator: None,
                down: false,
            }),
        }
    }

    pub fn outputs(&self) -> Receiver<OutMsg> {
        self.out_rx.clone()
    }

    /// True once any component thread died on an internal error.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Start the observer, merger, configurator and worker threads.
    pub fn start(&self) -> Result<()> {
        info!("starting spider with {} workers on {}", self.workers, self.uri);

        let mut inner = self.inner.lock();
        if inner.flows_tx.is_none() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);

        let flows_tx = inner.flows_tx.take().unwrap();
        let chains = self.plugin.chains();

        let observer = if chains.is_empty() {
            debug!("no chains, observer runs as a stub");
            let stop = self.obs_stop.clone();
            self.guard("observer", move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(QUEUE_SLEEP);
                }
                let _ = flows_tx.send(FlowMsg::Shutdown);
                Ok(())
            })
        } else {
            // the capture handle lives and dies on the observer thread
            let observer = Observer::new(chains);
            let stop = self.obs_stop.clone();
            let uri = self.uri.clone();
            self.guard("observer", move || {
                let source = open_uri(&uri)?;
                run_enqueuer(observer, source, &flows_tx, &stop)
            })
        };
        inner.observer = Some(observer);
        debug!("observer up");

        let flows_rx = inner.flows_rx.take().unwrap();
        let results_rx = inner.results_rx.take().unwrap();
        let out_tx = inner.out_tx.take().unwrap();
        let plugin = self.plugin.clone();
        let workers = self.workers;
        let running = self.running.clone();
        inner.merger = Some(self.guard("merger", move || {
            let mut combiner = Combiner::new(plugin.clone(), plugin.count(), out_tx.clone());
            Merger::new(workers).run(flows_rx, results_rx, &mut combiner, &running);
            let _ = out_tx.send(OutMsg::Shutdown);
            Ok(())
        }));
        debug!("merger up");

        let rendezvous = match self.plugin.mode() {
            Mode::Synchronized => {
                let rdv = Arc::new(Rendezvous::new(self.plugin.count(), self.workers));
                let plugin = self.plugin.clone();
                let running = self.running.clone();
                let cfg_rdv = rdv.clone();
                inner.configurator = Some(self.guard("configurator", move || {
                    sync::configurator(plugin, cfg_rdv, running)
                }));
                debug!("configurator up");
                Some(rdv)
            }
            Mode::Desynchronized | Mode::Forge => {
                info!("configurations are not synchronized");
                None
            }
        };

        self.active.store(self.workers, Ordering::SeqCst);
        let results_tx = inner.results_tx.clone().unwrap();

        for number in 0..self.workers {
            let ctx = WorkerCtx {
                plugin:   self.plugin.clone(),
                jobs:     self.jobs_rx.clone(),
                results:  results_tx.clone(),
                running:  self.running.clone(),
                stopping: self.stopping.clone(),
                active:   self.active.clone(),
            };
            let count = self.plugin.count();

            let handle = match &rendezvous {
                Some(rdv) => {
                    let rdv = rdv.clone();
                    self.guard("worker", move || sync::worker(ctx, rdv, number))
                }
                None => self.guard("worker", move || desync::worker(ctx, count, number)),
            };
            inner.workers.push(handle);
        }
        debug!("workers up");

        Ok(())
    }

    /// Queue one job unless shutdown has begun. Backpressure from a
    /// full queue is expected; a shutdown mid-wait drops the job.
    pub fn add_job(&self, job: Job) {
        let mut msg = JobMsg::Job(job);
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            match self.jobs_tx.send_timeout(msg, QUEUE_SLEEP) {
                Ok(())                               => return,
                Err(SendTimeoutError::Timeout(back)) => msg = back,
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    /// Orderly shutdown: drain queued jobs, collect every available
    /// result, then push the output sentinel.
    pub fn shutdown(&self) {
        info!("beginning shutdown");
        self.stopping.store(true, Ordering::Release);

        let mut inner = self.inner.lock();
        if inner.down {
            return;
        }
        inner.down = true;

        let mut sent = 0;
        while sent < self.workers * 2 && self.running.load(Ordering::Acquire) {
            match self.jobs_tx.send_timeout(JobMsg::Shutdown, QUEUE_SLEEP) {
                Ok(())                               => sent += 1,
                Err(SendTimeoutError::Timeout(_))    => continue,
                Err(SendTimeoutError::Disconnected(_)) => break,
            }
        }

        for worker in inner.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("all workers joined");

        self.obs_stop.store(true, Ordering::Release);
        if let Some(observer) = inner.observer.take() {
            let _ = observer.join();
        }
        debug!("observer shutdown");

        if let Some(results_tx) = inner.results_tx.take() {
            let _ = results_tx.send(ResMsg::Shutdown);
        }
        if let Some(merger) = inner.merger.take() {
            let _ = merger.join();
        }
        debug!("merger shutdown");

        self.running.store(false, Ordering::Release);
        if let Some(configurator) = inner.configurator.take() {
            let _ = configurator.join();
        }

        info!("shutdown complete");
    }

    /// Fast shutdown: pending jobs and results are dropped, but the
    /// output sentinel still goes out so the sink finishes cleanly.
    pub fn terminate(&self) {
        info!("terminating");

        self.stopping.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.obs_stop.store(true, Ordering::Release);

        let mut inner = self.inner.lock();
        if inner.down {
            return;
        }
        inner.down = true;

        // unblock anything stuck on the bounded job queue
        while self.jobs_rx.try_recv().is_ok() {}

        for worker in inner.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("all workers joined");

        if let Some(observer) = inner.observer.take() {
            let _ = observer.join();
        }

        if let Some(results_tx) = inner.results_tx.take() {
            let _ = results_tx.try_send(ResMsg::Shutdown);
        }
        if let Some(merger) = inner.merger.take() {
            let _ = merger.join();
        }

        if let Some(configurator) = inner.configurator.take() {
            let _ = configurator.join();
        }

        info!("termination complete");
    }

    fn guard<F>(&self, name: &'static str, f: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let running = self.running.clone();
        let stopping = self.stopping.clone();
        let obs_stop = self.obs_stop.clone();
        let failed = self.failed.clone();

        thread::spawn(move || match f() {
            Ok(())  => debug!("{} finished", name),
            Err(e)  => {
                error!("{} failed: {:?}, terminating", name, e);
                failed.store(true, Ordering::Release);
                stopping.store(true, Ordering::Release);
                obs_stop.store(true, Ordering::Release);
                running.store(false, Ordering::Release);
            }
        })
    }
}
