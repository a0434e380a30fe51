use std::process::Command;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use log::{debug, warn};
use crate::chains::{BasicChain, DscpChain, TcpChain};
use crate::helpers::tcp::connect_tcp;
use crate::observer::Chain;
use crate::spider::{ConnRecord, ConnState, Job, MergedRecord};
use crate::spider::record::combine_connectivity;
use super::{not_observed, Mode, Plugin};

/// Differentiated Services codepoints. The baseline leaves packets
/// unmarked, the experimental variant marks outgoing TCP with the
/// chosen codepoint through an iptables mangle rule; the rule is
/// process-wide, hence a synchronized plugin.
pub struct Dscp {
    codepoint: u8,
    port:      u16,
    timeout:   Duration,
}

impl Dscp {
    pub fn from_args(args: &ArgMatches) -> Result<Self> {
        let codepoint = args.value_of("codepoint").unwrap_or("48").parse::<u8>()
            .context("invalid codepoint")?;
        if codepoint > 63 {
            return Err(anyhow!("codepoint {} out of range", codepoint));
        }

        let port = args.value_of("tcp-port").unwrap_or("80").parse::<u16>()
            .context("invalid tcp port")?;

        let timeout = args.value_of("timeout").unwrap_or("5").parse::<u64>()
            .context("invalid timeout")?;

        Ok(Self {
            codepoint: codepoint,
            port:      port,
            timeout:   Duration::from_secs(timeout),
        })
    }

    fn flush_mangle(&self) -> Result<()> {
        for iptables in &["iptables", "ip6tables"] {
            let status = Command::new(iptables)
                .args(&["-t", "mangle", "-F"])
                .status()
                .context("iptables not available")?;
            if !status.success() {
                return Err(anyhow!("{} -t mangle -F failed", iptables));
            }
        }
        debug!("disabled DSCP marking");
        Ok(())
    }

    fn mark_output(&self) -> Result<()> {
        for iptables in &["iptables", "ip6tables"] {
            let status = Command::new(iptables)
                .args(&["-t", "mangle", "-A", "OUTPUT", "-p", "tcp", "-m", "tcp",
                        "--dport", &self.port.to_string(),
                        "-j", "DSCP", "--set-dscp", &self.codepoint.to_string()])
                .status()
                .context("iptables not available")?;
            if !status.success() {
                return Err(anyhow!("{} mangle append failed", iptables));
            }
        }
        debug!("enabled DSCP marking with codepoint {}", self.codepoint);
        Ok(())
    }
}

impl Plugin for Dscp {
    fn name(&self) -> &'static str {
        "dscp"
    }

    fn mode(&self) -> Mode {
        Mode::Synchronized
    }

    fn count(&self) -> usize {
        2
    }

    fn chains(&self) -> Vec<Box<dyn Chain>> {
        vec![
            Box::new(BasicChain::new()),
            Box::new(TcpChain::new()),
            Box::new(DscpChain::new()),
        ]
    }

    fn configure(&self, config: usize) -> Result<()> {
        match config {
            0 => self.flush_mangle(),
            _ => self.mark_output(),
        }
    }

    fn teardown(&self) {
        if let Err(e) = self.flush_mangle() {
            warn!("failed to flush mangle tables: {}", e);
        }
    }

    fn connect(&self, job: &Job, _config: usize) -> ConnRecord {
        if job.dp != self.port {
            warn!("destination port mismatch for {}, skipping", job.dip);
            return ConnRecord::new(0, ConnState::Skipped);
        }

        connect_tcp(job, self.timeout)
    }

    fn combine_flows(&self, flows: &[MergedRecord]) -> Option<Vec<String>> {
        if flows.iter().any(|f| !f.observed()) {
            return Some(not_observed());
        }

        let mark = |flow: &MergedRecord, key: &str| {
            match flow.int_field(key) {
                Some(mark) => mark.to_string(),
                None       => "none".to_owned(),
            }
        };

        let baseline = format!("dscp.{}", mark(&flows[0], "dscp_mark_syn_fwd"));
        let test = format!("dscp.{}", mark(&flows[1], "dscp_mark_syn_fwd"));

        let conditions = vec![
            combine_connectivity(&test, flows[0].ok(), Some(flows[1].ok())),
            format!("{}.replymark:{}", baseline, mark(&flows[0], "dscp_mark_syn_rev")),
            format!("{}.replymark:{}", test, mark(&flows[1], "dscp_mark_syn_rev")),
        ];

        Some(conditions)
    }
}
