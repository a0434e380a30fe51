pub mod combiner;
pub mod desync;
pub mod job;
pub mod merger;
pub mod record;
pub mod semaphore;
pub mod sync;
pub mod worker;

pub use job::Job;
pub use record::{ConnRecord, ConnState, MergedRecord};
pub use spider::Spider;

mod spider;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde_json::Value;

pub const QUEUE_SIZE: usize = 1000;
pub const QUEUE_SLEEP: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub enum JobMsg {
    Job(Job),
    Shutdown,
}

#[derive(Clone, Debug)]
pub enum ResMsg {
    Job(String, Job),
    Conn(ConnRecord),
    Shutdown,
}

#[derive(Clone, Debug)]
pub enum FlowMsg {
    Flow(crate::observer::FlowRecord),
    Shutdown,
}

#[derive(Clone, Debug)]
pub enum OutMsg {
    Record(Value),
    Shutdown,
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn next_job_id() -> String {
    format!("{:016x}", JOB_SEQ.fetch_add(1, Ordering::Relaxed))
}
