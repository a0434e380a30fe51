use std::collections::HashSet;
use std::io::BufRead;
use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One measurement target. `dip` and `dp` are required; anything else a
/// target list carries rides along untouched and reappears in the output
/// record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub dip: String,
    #[serde(default)]
    pub dp:  u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(dip: &str, dp: u16) -> Self {
        Self {
            dip:    dip.to_owned(),
            dp:     dp,
            domain: None,
            extra:  Map::new(),
        }
    }
}

/// Feed jobs from a line-delimited source, de-duplicating on `dip`.
/// Returns the number of jobs submitted. Malformed lines are skipped.
pub fn feed_ndjson<R, F>(input: R, mut submit: F) -> Result<usize>
where
    R: BufRead,
    F: FnMut(Job),
{
    let mut seen = HashSet::new();
    let mut count = 0;

    debug!("job feeder started");

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Job>(&line) {
            Ok(job) => {
                if !seen.insert(job.dip.clone()) {
                    debug!("target {} already submitted, skipping", job.dip);
                    continue;
                }
                submit(job);
                count += 1;
            }
            Err(e) => warn!("unable to decode a job, skipping: {}", e),
        }
    }

    info!("job feeder done, {} jobs submitted", count);

    Ok(count)
}

/// CSV variant of the feeder: `dip,dp,domain,rank` rows.
pub fn feed_csv<R, F>(input: R, mut submit: F) -> Result<usize>
where
    R: BufRead,
    F: FnMut(Job),
{
    let mut seen = HashSet::new();
    let mut count = 0;

    debug!("job feeder started");

    for line in input.lines() {
        let line = line?;
        let row: Vec<&str> = line.trim().split(',').collect();

        if row.len() != 4 {
            warn!("unable to read a row for a job, skipping");
            continue;
        }

        let dp = match row[1].parse::<u16>() {
            Ok(dp) => dp,
            Err(_) => {
                warn!("unable to read a row for a job, skipping");
                continue;
            }
        };

        if !seen.insert(row[0].to_owned()) {
            debug!("target {} already submitted, skipping", row[0]);
            continue;
        }

        let mut job = Job::new(row[0], dp);
        job.domain = Some(row[2].to_owned());
        job.extra.insert("rank".to_owned(), Value::from(row[3]));
        submit(job);
        count += 1;
    }

    info!("job feeder done, {} jobs submitted", count);

    Ok(count)
}
