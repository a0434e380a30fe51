use std::process::{Command, Stdio};
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use log::{debug, warn};
use parking_lot::Mutex;
use crate::chains::{BasicChain, EcnChain, TcpChain};
use crate::chains::tcp::{TCP_SAE, TCP_SAEC};
use crate::helpers::dns::{connect_dns_tcp, connect_dns_udp};
use crate::helpers::http::connect_http;
use crate::helpers::tcp::connect_tcp;
use crate::observer::Chain;
use crate::spider::{ConnRecord, Job, MergedRecord};
use crate::spider::record::combine_connectivity;
use super::{not_observed, Mode, Plugin};

const SYSCTL: &str = "/sbin/sysctl";
const TCP_ECN: &str = "net.ipv4.tcp_ecn";

#[derive(Copy, Clone)]
enum ConnectKind {
    Tcp,
    Http,
    DnsTcp,
    DnsUdp,
}

/// Explicit Congestion Notification. Baseline disables ECN negotiation
/// on outgoing SYNs, the experimental variant requests it; both are
/// process-wide sysctls, hence a synchronized plugin.
pub struct Ecn {
    kind:    ConnectKind,
    timeout: Duration,
    saved:   Mutex<Option<String>>,
}

impl Ecn {
    pub fn from_args(args: &ArgMatches) -> Result<Self> {
        let kind = match args.value_of("connect").unwrap_or("tcp") {
            "tcp"    => ConnectKind::Tcp,
            "http"   => ConnectKind::Http,
            "dnstcp" => ConnectKind::DnsTcp,
            "dnsudp" => ConnectKind::DnsUdp,
            other    => return Err(anyhow!("unknown connection type '{}'", other)),
        };

        let timeout = args.value_of("timeout").unwrap_or("5").parse::<u64>()
            .context("invalid timeout")?;

        Ok(Self {
            kind:    kind,
            timeout: Duration::from_secs(timeout),
            saved:   Mutex::new(None),
        })
    }

    fn sysctl_set(&self, value: &str) -> Result<()> {
        let status = Command::new(SYSCTL)
            .arg("-w")
            .arg(format!("{}={}", TCP_ECN, value))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("sysctl not available")?;

        match status.success() {
            true  => Ok(()),
            false => Err(anyhow!("sysctl {}={} failed", TCP_ECN, value)),
        }
    }

    fn save_original(&self) -> Result<()> {
        let mut saved = self.saved.lock();
        if saved.is_some() {
            return Ok(());
        }

        let output = Command::new(SYSCTL)
            .arg("-n")
            .arg(TCP_ECN)
            .output()
            .context("sysctl not available")?;

        let value = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        debug!("saving {}={} for teardown", TCP_ECN, value);
        *saved = Some(value);

        Ok(())
    }
}

impl Plugin for Ecn {
    fn name(&self) -> &'static str {
        "ecn"
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
            Box::new(EcnChain::new()),
        ]
    }

    fn configure(&self, config: usize) -> Result<()> {
        self.save_original()?;
        match config {
            0 => self.sysctl_set("2"),
            _ => self.sysctl_set("1"),
        }
    }

    fn teardown(&self) {
        if let Some(value) = self.saved.lock().take() {
            if let Err(e) = self.sysctl_set(&value) {
                warn!("failed to restore {}: {}", TCP_ECN, e);
            }
        }
    }

    fn connect(&self, job: &Job, _config: usize) -> ConnRecord {
        match self.kind {
            ConnectKind::Tcp    => connect_tcp(job, self.timeout),
            ConnectKind::Http   => connect_http(job, self.timeout),
            ConnectKind::DnsTcp => connect_dns_tcp(job, self.timeout),
            ConnectKind::DnsUdp => connect_dns_udp(job, self.timeout),
        }
    }

    fn combine_flows(&self, flows: &[MergedRecord]) -> Option<Vec<String>> {
        if flows.iter().any(|f| !f.observed()) {
            return Some(not_observed());
        }

        let baseline = flows[0].ok();
        let experimental = flows[1].ok();

        let mut conditions = vec![
            combine_connectivity("ecn", baseline, Some(experimental)),
        ];

        let mut negotiated = None;
        if let Some(flags) = flows[1].int_field("tcp_synflags_rev") {
            let ok = flags as u16 & TCP_SAEC == TCP_SAE;
            negotiated = Some(ok);
            conditions.push(match ok {
                true  => "ecn.negotiation.succeeded".to_owned(),
                false => "ecn.negotiation.failed".to_owned(),
            });
        }

        if let Some(negotiated) = negotiated {
            let marks = [
                ("ecn_ect0", "ecn.ect_zero"),
                ("ecn_ect1", "ecn.ect_one"),
                ("ecn_ce", "ecn.ce"),
            ];
            for (field, tag) in marks.iter() {
                let seen = flows[1].bool_field(&format!("{}_syn_rev", field)).unwrap_or(false)
                        || flows[1].bool_field(&format!("{}_data_rev", field)).unwrap_or(false);
                if seen {
                    conditions.push(match negotiated {
                        true  => format!("{}.seen", tag),
                        false => format!("{}.unwanted", tag),
                    });
                }
            }
        }

        Some(conditions)
    }
}
