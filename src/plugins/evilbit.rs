use anyhow::{anyhow, Result};
use clap::ArgMatches;
use log::warn;
use crate::chains::{BasicChain, DnsChain, EvilChain, TcpChain};
use crate::chains::tcp::TCP_SA;
use crate::helpers::forge::{forge_dns_udp, forge_tcp_syn, random_port, send, ForgedPacket};
use crate::observer::Chain;
use crate::spider::{ConnRecord, ConnState, Job, MergedRecord};
use crate::spider::record::combine_connectivity;
use super::{not_observed, Mode, Plugin};

#[derive(Copy, Clone)]
enum ConnectKind {
    TcpSyn,
    DnsUdp,
}

/// RFC 3514 evil bit connectivity. The variant lives entirely inside
/// the forged packets, so no configurator rendezvous is involved: the
/// first packet is sent with the reserved flag clear, the second with
/// it set.
pub struct EvilBit {
    kind: ConnectKind,
}

impl EvilBit {
    pub fn from_args(args: &ArgMatches) -> Result<Self> {
        let kind = match args.value_of("connect").unwrap_or("tcpsyn") {
            "tcpsyn" => ConnectKind::TcpSyn,
            "dnsudp" => ConnectKind::DnsUdp,
            other    => return Err(anyhow!("unknown connection type '{}'", other)),
        };

        Ok(Self { kind })
    }

    fn forge(&self, job: &Job, seq: usize) -> Result<ForgedPacket> {
        let sp = random_port();
        let evil = seq == 1;

        match self.kind {
            ConnectKind::TcpSyn => forge_tcp_syn(job, sp, evil),
            ConnectKind::DnsUdp => {
                let domain = job.domain.as_deref()
                    .ok_or_else(|| anyhow!("dnsudp probes need a domain"))?;
                forge_dns_udp(job, sp, domain, evil)
            }
        }
    }
}

impl Plugin for EvilBit {
    fn name(&self) -> &'static str {
        "evilbit"
    }

    fn mode(&self) -> Mode {
        Mode::Forge
    }

    fn count(&self) -> usize {
        2
    }

    fn chains(&self) -> Vec<Box<dyn Chain>> {
        vec![
            Box::new(BasicChain::new()),
            Box::new(DnsChain::new()),
            Box::new(TcpChain::new()),
            Box::new(EvilChain::new()),
        ]
    }

    fn connect(&self, job: &Job, config: usize) -> ConnRecord {
        let pkt = match self.forge(job, config) {
            Ok(pkt) => pkt,
            Err(e)  => {
                warn!("unable to forge probe for {}: {}", job.dip, e);
                return ConnRecord::new(0, ConnState::Skipped);
            }
        };

        match send(&pkt) {
            Ok(())  => ConnRecord::new(pkt.sp, ConnState::Ok),
            Err(e)  => {
                warn!("unable to send probe to {}: {}", job.dip, e);
                ConnRecord::new(pkt.sp, ConnState::Failed)
            }
        }
    }

    fn combine_flows(&self, flows: &[MergedRecord]) -> Option<Vec<String>> {
        if flows.iter().any(|f| !f.observed()) {
            return Some(not_observed());
        }

        let answered = |flow: &MergedRecord| match self.kind {
            ConnectKind::TcpSyn => flow.int_field("tcp_synflags_rev")
                .map(|f| f as u16 & TCP_SA == TCP_SA)
                .unwrap_or(false),
            ConnectKind::DnsUdp => flow.bool_field("dns_response_valid")
                .unwrap_or(false),
        };

        let baseline = answered(&flows[0]);
        let experimental = answered(&flows[1]);

        let mut conditions = vec![
            combine_connectivity("evilbit", baseline, Some(experimental)),
        ];

        if baseline && experimental {
            let mark = match self.kind {
                ConnectKind::TcpSyn => flows[1].bool_field("evilbit_syn_rev"),
                ConnectKind::DnsUdp => flows[1].bool_field("evilbit_data_rev"),
            };
            conditions.push(match mark.unwrap_or(false) {
                true  => "evilbit.mark.seen".to_owned(),
                false => "evilbit.mark.not_seen".to_owned(),
            });
        }

        Some(conditions)
    }
}
