use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, warn};
use serde_json::{Map, Value};
use crate::observer::FlowRecord;
use super::combiner::Combiner;
use super::record::{ConnRecord, ConnState, MergedRecord};
use super::{FlowMsg, ResMsg, QUEUE_SLEEP};

/// A failed connect never learned its source port.
const PORT_FAILED: i64 = 0;
/// Slot for the second failed connect to the same target.
const PORT_FAILED_AGAIN: i64 = -1;

type Key = (String, Option<i64>);

/// Joins what the workers did with what the wire showed, on the
/// (dip, sp) key. Either side can arrive first; unmatched entries wait
/// in their table. The flow table is capped by a FIFO of keys so a
/// noisy interface cannot grow it without bound.
pub struct Merger {
    flowtab:  HashMap<Key, FlowRecord>,
    restab:   HashMap<Key, ConnRecord>,
    flowreap: VecDeque<Key>,
    reap_cap: usize,
}

impl Merger {
    pub fn new(workers: usize) -> Self {
        Self {
            flowtab:  HashMap::new(),
            restab:   HashMap::new(),
            flowreap: VecDeque::new(),
            reap_cap: (workers * 100).max(10_000),
        }
    }

    /// Drain both queues until each has delivered its shutdown marker,
    /// feeding merged records into the combiner. Always drains the
    /// longer queue first.
    pub fn run(&mut self, flows: Receiver<FlowMsg>, results: Receiver<ResMsg>,
               combiner: &mut Combiner, running: &AtomicBool) {
        let mut merging_flows = true;
        let mut merging_results = true;

        while running.load(Ordering::Acquire) && (merging_flows || merging_results) {
            if merging_flows && flows.len() >= results.len() {
                merging_flows = self.step_flow(&flows, combiner);
            } else if merging_results {
                merging_results = self.step_result(&results, combiner);
            } else {
                thread::sleep(QUEUE_SLEEP);
            }
        }

        // Results that never saw their flow are still results.
        for (_, res) in self.restab.drain() {
            if let Some(rec) = merge(None, &res) {
                combiner.push(rec);
            }
        }

        debug!("merger done, dropping {} orphan flows", self.flowtab.len());
        self.flowtab.clear();
        self.flowreap.clear();
    }

    fn step_flow(&mut self, flows: &Receiver<FlowMsg>, combiner: &mut Combiner) -> bool {
        let flow = match flows.try_recv() {
            Ok(FlowMsg::Flow(flow)) => flow,
            Ok(FlowMsg::Shutdown)   => {
                debug!("stopping flow merging on sentinel");
                return false;
            }
            Err(TryRecvError::Empty) => {
                thread::sleep(QUEUE_SLEEP);
                return true;
            }
            Err(TryRecvError::Disconnected) => return false,
        };

        self.handle_flow(flow, combiner);
        true
    }

    fn handle_flow(&mut self, flow: FlowRecord, combiner: &mut Combiner) {
        let key = flow_key(&flow);
        debug!("got a flow {:?}", key);

        if let Some(res) = self.restab.remove(&key) {
            if let Some(rec) = merge(Some(flow), &res) {
                combiner.push(rec);
            }
        } else if self.flowtab.contains_key(&key) {
            debug!("won't merge duplicate flow {:?}", key);
        } else {
            self.flowtab.insert(key.clone(), flow);
            self.flowreap.push_back(key);
            if self.flowreap.len() > self.reap_cap {
                if let Some(oldest) = self.flowreap.pop_front() {
                    self.flowtab.remove(&oldest);
                }
            }
        }
    }

    fn step_result(&mut self, results: &Receiver<ResMsg>, combiner: &mut Combiner) -> bool {
        let res = match results.try_recv() {
            Ok(ResMsg::Conn(res))    => res,
            Ok(ResMsg::Job(id, job)) => {
                combiner.register_job(id, job);
                return true;
            }
            Ok(ResMsg::Shutdown)     => {
                debug!("stopping result merging on sentinel");
                return false;
            }
            Err(TryRecvError::Empty) => {
                thread::sleep(QUEUE_SLEEP);
                return true;
            }
            Err(TryRecvError::Disconnected) => return false,
        };

        self.handle_result(res, combiner);
        true
    }

    fn handle_result(&mut self, res: ConnRecord, combiner: &mut Combiner) {
        if res.spdr_state == ConnState::Skipped {
            return;
        }

        let mut key = (res.dip.clone(), Some(res.sp as i64));
        debug!("got a result {:?}", key);

        // Two failed attempts to one target both carry port zero but
        // must stay distinguishable until shutdown.
        if res.sp as i64 == PORT_FAILED && self.restab.contains_key(&key) {
            key = (res.dip.clone(), Some(PORT_FAILED_AGAIN));
        }

        if let Some(flow) = self.flowtab.remove(&key) {
            if let Some(rec) = merge(Some(flow), &res) {
                combiner.push(rec);
            }
        } else if self.restab.contains_key(&key) {
            debug!("won't merge duplicate result {:?}", key);
        } else {
            self.restab.insert(key, res);
        }
    }
}

fn flow_key(flow: &FlowRecord) -> Key {
    (flow.dip.clone(), flow.sp.map(i64::from))
}

/// Merge a connection record into its observed flow (or a synthetic
/// unobserved one). Conn fields fill in null or missing flow fields; a
/// disagreement on a populated field means the observer matched two
/// unrelated flows onto one key, so the record is dropped. Keys
/// prefixed with an underscore are private to the observer and
/// stripped.
pub fn merge(flow: Option<FlowRecord>, res: &ConnRecord) -> Option<MergedRecord> {
    let observed = flow.is_some();

    let mut map = match flow {
        Some(flow) => match serde_json::to_value(&flow) {
            Ok(Value::Object(map)) => map,
            _                      => Map::new(),
        },
        None => Map::new(),
    };

    map.insert("observed".to_owned(), Value::from(observed));

    let res_map = match serde_json::to_value(res) {
        Ok(Value::Object(map)) => map,
        _                      => return None,
    };

    for (key, value) in res_map {
        match map.get(&key) {
            None | Some(Value::Null) => {
                map.insert(key, value);
            }
            Some(existing) => {
                if value.is_null() || *existing == value {
                    continue;
                }
                warn!("dropping flow due to mismatch with observations on key {}", key);
                return None;
            }
        }
    }

    map.retain(|key, _| !key.starts_with('_'));

    Some(MergedRecord(map))
}
