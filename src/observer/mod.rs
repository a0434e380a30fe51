pub mod chain;
pub mod decode;
pub mod flow;
pub mod source;

pub use chain::Chain;
pub use decode::PacketView;
pub use flow::{flow_key, FlowKey, FlowRecord};
pub use source::{open_uri, run_enqueuer, Source};

#[cfg(test)]
pub mod testpkt;

use std::collections::{HashMap, HashSet, VecDeque};
use log::{debug, info};

pub const IDLE_TIMEOUT: u64 = 30;
pub const EXPIRY_TIMEOUT: u64 = 5;
pub const BIN_QUANTUM: u64 = 1;

struct FlowEntry {
    rec:      FlowRecord,
    orient:   bool,
    idle_bin: u64,
}

/// Groups captured packets into bidirectional flows and runs the chain
/// hooks over them. Flows are emitted once complete: either a chain
/// said so and the expiry timeout passed, or the idle timeout fired.
/// All timing runs on a quantised clock advanced from packet
/// timestamps, so replay from a trace behaves exactly like live
/// capture.
pub struct Observer {
    chains: Vec<Box<dyn Chain>>,

    idle_timeout:   u64,
    expiry_timeout: u64,
    bin_quantum:    u64,
    clock:          u64,

    active:   HashMap<FlowKey, FlowEntry>,
    expiring: HashMap<FlowKey, FlowRecord>,
    ignored:  HashSet<FlowKey>,

    idle_bins:   HashMap<u64, HashSet<FlowKey>>,
    expiry_bins: HashMap<u64, HashSet<FlowKey>>,

    emitted: VecDeque<FlowRecord>,

    ct_pkt:      u64,
    ct_nonip:    u64,
    ct_shortkey: u64,
    ct_ignored:  u64,
    ct_flow:     u64,
}

impl Observer {
    pub fn new(chains: Vec<Box<dyn Chain>>) -> Self {
        Self::with_timeouts(chains, IDLE_TIMEOUT, EXPIRY_TIMEOUT)
    }

    pub fn with_timeouts(chains: Vec<Box<dyn Chain>>, idle: u64, expiry: u64) -> Self {
        Self {
            chains:         chains,
            idle_timeout:   idle,
            expiry_timeout: expiry,
            bin_quantum:    BIN_QUANTUM,
            clock:          0,
            active:         HashMap::new(),
            expiring:       HashMap::new(),
            ignored:        HashSet::new(),
            idle_bins:      HashMap::new(),
            expiry_bins:    HashMap::new(),
            emitted:        VecDeque::new(),
            ct_pkt:         0,
            ct_nonip:       0,
            ct_shortkey:    0,
            ct_ignored:     0,
            ct_flow:        0,
        }
    }

    /// Feed one captured frame through the flow table and chains.
    pub fn packet(&mut self, ts: f64, frame: &[u8]) {
        self.ct_pkt += 1;

        let pkt = match PacketView::new(ts, frame) {
            Some(pkt) => pkt,
            None      => {
                self.ct_nonip += 1;
                return;
            }
        };

        self.tick(ts);

        let (key, orient) = match flow_key(&pkt) {
            Some(id) => id,
            None     => {
                self.ct_shortkey += 1;
                return;
            }
        };

        if self.ignored.contains(&key) {
            return;
        }

        // Expiring flows still match so late packets don't open a
        // second entry, but they take no further updates.
        if self.expiring.contains_key(&key) {
            return;
        }

        if !self.active.contains_key(&key) {
            let mut rec = FlowRecord::new(&pkt);
            for chain in self.chains.iter_mut() {
                if !chain.new_flow(&mut rec, &pkt) {
                    self.ignored.insert(key);
                    self.ct_ignored += 1;
                    return;
                }
            }

            self.ct_flow += 1;
            self.active.insert(key.clone(), FlowEntry {
                rec:      rec,
                orient:   orient,
                idle_bin: 0,
            });
        }

        let entry = match self.active.get_mut(&key) {
            Some(entry) => entry,
            None        => return,
        };

        let rev = orient != entry.orient;
        entry.rec.pkt_last = ts;

        // refresh the idle bin
        let idle_bin = bin_up(ts + self.idle_timeout as f64, self.bin_quantum);
        if idle_bin > entry.idle_bin {
            if let Some(bin) = self.idle_bins.get_mut(&entry.idle_bin) {
                bin.remove(&key);
            }
            self.idle_bins.entry(idle_bin).or_insert_with(HashSet::new).insert(key.clone());
            entry.idle_bin = idle_bin;
        }

        let mut keep = true;
        let rec = &mut entry.rec;

        if pkt.is_v4() {
            for chain in self.chains.iter_mut() {
                if !keep { break }
                keep = chain.ip4(rec, &pkt, rev);
            }
            if pkt.icmp().is_some() {
                for chain in self.chains.iter_mut() {
                    if !keep { break }
                    keep = chain.icmp4(rec, &pkt, rev);
                }
            }
        } else {
            for chain in self.chains.iter_mut() {
                if !keep { break }
                keep = chain.ip6(rec, &pkt, rev);
            }
            if pkt.icmp6().is_some() {
                for chain in self.chains.iter_mut() {
                    if !keep { break }
                    keep = chain.icmp6(rec, &pkt, rev);
                }
            }
        }

        if let Some(tcp) = pkt.tcp() {
            for chain in self.chains.iter_mut() {
                if !keep { break }
                keep = chain.tcp(rec, &tcp, rev);
            }
        } else if let Some(udp) = pkt.udp() {
            for chain in self.chains.iter_mut() {
                if !keep { break }
                keep = chain.udp(rec, &udp, rev);
            }
        }

        if !keep {
            let now = self.clock;
            self.complete(&key, now);
        }
    }

    /// Move an active flow to the expiring table and schedule its
    /// emission.
    fn complete(&mut self, key: &FlowKey, now: u64) {
        let entry = match self.active.remove(key) {
            Some(entry) => entry,
            None        => return,
        };

        if let Some(bin) = self.idle_bins.get_mut(&entry.idle_bin) {
            bin.remove(key);
        }

        let expiry_bin = bin_up((now + self.expiry_timeout) as f64, self.bin_quantum);
        self.expiry_bins.entry(expiry_bin).or_insert_with(HashSet::new).insert(key.clone());
        self.expiring.insert(key.clone(), entry.rec);
    }

    /// Advance the packet clock, draining every idle and expiry bin it
    /// passes over.
    fn tick(&mut self, ts: f64) {
        let next = bin_up(ts, self.bin_quantum);
        if next <= self.clock {
            return;
        }

        if self.clock == 0 {
            self.clock = next;
            return;
        }

        let mut bin = self.clock + self.bin_quantum;
        while bin <= next {
            debug!("tick: {}", bin);

            if let Some(keys) = self.idle_bins.remove(&bin) {
                for key in keys {
                    self.complete(&key, bin);
                }
            }

            if let Some(keys) = self.expiry_bins.remove(&bin) {
                for key in keys {
                    if let Some(rec) = self.expiring.remove(&key) {
                        self.emitted.push_back(rec);
                    }
                }
            }

            bin += self.bin_quantum;
        }

        self.clock = next;
    }

    /// Emit everything still in the tables, exactly once each. Called
    /// at end of capture or on interrupt.
    pub fn flush(&mut self) {
        for (_, rec) in self.expiring.drain() {
            self.emitted.push_back(rec);
        }

        for (_, entry) in self.active.drain() {
            self.emitted.push_back(entry.rec);
        }

        self.ignored.clear();
        self.idle_bins.clear();
        self.expiry_bins.clear();
    }

    pub fn next_emitted(&mut self) -> Option<FlowRecord> {
        self.emitted.pop_front()
    }

    pub fn log_stats(&self) {
        info!("processed {} packets ({} short, {} non-ip) into {} flows ({} ignored)",
              self.ct_pkt, self.ct_shortkey, self.ct_nonip, self.ct_flow, self.ct_ignored);
    }
}

fn bin_up(value: f64, quantum: u64) -> u64 {
    (value / quantum as f64).ceil() as u64 * quantum
}
