use std::collections::HashMap;
use std::sync::Arc;
use crossbeam_channel::Sender;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use crate::plugins::Plugin;
use super::record::{ConnState, MergedRecord};
use super::{Job, OutMsg};

/// Collects the N merged records belonging to one job and produces the
/// single output record for the target once the set is complete.
pub struct Combiner {
    plugin:     Arc<dyn Plugin>,
    count:      usize,
    comparetab: HashMap<String, Vec<MergedRecord>>,
    jobtab:     HashMap<String, Job>,
    out:        Sender<OutMsg>,
}

impl Combiner {
    pub fn new(plugin: Arc<dyn Plugin>, count: usize, out: Sender<OutMsg>) -> Self {
        Self {
            plugin:     plugin,
            count:      count,
            comparetab: HashMap::new(),
            jobtab:     HashMap::new(),
            out:        out,
        }
    }

    pub fn register_job(&mut self, id: String, job: Job) {
        self.jobtab.insert(id, job);
    }

    pub fn push(&mut self, rec: MergedRecord) {
        let id = match rec.job_id() {
            Some(id) => id.to_owned(),
            None     => {
                warn!("merged record without a job id, dropping");
                return;
            }
        };

        let stash = self.comparetab.entry(id.clone()).or_insert_with(Vec::new);
        stash.push(rec);

        if stash.len() < self.count {
            return;
        }

        let mut flows = self.comparetab.remove(&id).unwrap();
        flows.sort_by_key(MergedRecord::config);

        if flows.iter().any(|f| f.state() == Some(ConnState::Discard)) {
            debug!("discarding job {}", id);
            self.jobtab.remove(&id);
            return;
        }

        let job = match self.jobtab.remove(&id) {
            Some(job) => job,
            None      => {
                warn!("no job record for {}, dropping", id);
                return;
            }
        };

        let from = flows.iter().filter_map(|f| f.str_field("spdr_start")).min();
        let to = flows.iter().filter_map(|f| f.str_field("spdr_stop")).max();
        let missed = flows.iter().filter(|f| !f.observed()).count();

        let conditions = self.plugin.combine_flows(&flows);

        let mut record = match serde_json::to_value(&job) {
            Ok(Value::Object(map)) => map,
            _                      => Map::new(),
        };

        record.insert("jobId".to_owned(), Value::from(id));
        record.insert("time".to_owned(), json!({ "from": from, "to": to }));

        if let Some(mut conditions) = conditions {
            if missed > 0 {
                debug!("{} flows for this job went unobserved", missed);
                conditions.push(format!("pathprobe.missed_flows:{}", missed));
            }
            record.insert("conditions".to_owned(), Value::from(conditions));
        }

        record.insert("missed_flows".to_owned(), Value::from(missed));
        let flows: Vec<Value> = flows.into_iter().map(|f| Value::Object(f.0)).collect();
        record.insert("flow_results".to_owned(), Value::from(flows));

        if self.out.send(OutMsg::Record(Value::Object(record))).is_err() {
            warn!("output queue gone, dropping result");
        }
    }
}
