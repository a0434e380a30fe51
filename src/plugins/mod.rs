pub mod dscp;
pub mod ecn;
pub mod evilbit;

pub use dscp::Dscp;
pub use ecn::Ecn;
pub use evilbit::EvilBit;

use std::sync::Arc;
use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde_json::Value;
use crate::observer::Chain;
use crate::spider::{ConnRecord, Job, MergedRecord};

pub const NAMES: [&str; 3] = ["dscp", "ecn", "evilbit"];

/// How a plugin's probe variants are driven. Synchronized plugins
/// mutate process-wide state, so the configurator walks every worker
/// through the variants in lockstep; desynchronized and forge plugins
/// encode the variant in the connection or packet itself and need no
/// rendezvous.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Synchronized,
    Desynchronized,
    Forge,
}

/// A measurement plugin. The core calls these hooks at documented
/// points and owns all the machinery in between; plugins never touch
/// the queues or the flow table.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn mode(&self) -> Mode;

    /// Number of probe variants per target. Variant 0 is the baseline.
    fn count(&self) -> usize;

    /// Observer chains to attach for this measurement.
    fn chains(&self) -> Vec<Box<dyn Chain>>;

    /// Apply process-wide state for one variant. Synchronized plugins
    /// only; called by the configurator, never by workers.
    fn configure(&self, _config: usize) -> Result<()> {
        Ok(())
    }

    /// Restore whatever `configure` changed. Runs even on interrupt.
    fn teardown(&self) {}

    fn pre_connect(&self, _job: &Job) {}

    /// One connection attempt (or forged packet) for a variant.
    fn connect(&self, job: &Job, config: usize) -> ConnRecord;

    fn post_connect(&self, _job: &Job, _rec: &mut ConnRecord, _config: usize) {}

    /// Turn the N merged records of one target into condition tags.
    /// None drops the conditions field entirely.
    fn combine_flows(&self, flows: &[MergedRecord]) -> Option<Vec<String>>;

    fn wants_aggregate(&self) -> bool {
        false
    }

    /// Post-run hook over all output records, for plugins that opted
    /// in with `wants_aggregate`.
    fn aggregate(&self, _records: &[Value]) {}
}

/// Instantiate a plugin from its measure subcommand.
pub fn lookup(name: &str, args: &ArgMatches) -> Result<Arc<dyn Plugin>> {
    match name {
        "dscp"    => Ok(Arc::new(Dscp::from_args(args)?)),
        "ecn"     => Ok(Arc::new(Ecn::from_args(args)?)),
        "evilbit" => Ok(Arc::new(EvilBit::from_args(args)?)),
        _         => Err(anyhow!("plugin '{}' not found", name)),
    }
}

/// The tag plugins return when a flow they need was never observed.
pub fn not_observed() -> Vec<String> {
    vec!["pathprobe.not_observed".to_owned()]
}
