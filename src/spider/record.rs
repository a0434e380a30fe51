use std::fmt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::Error as DeError;
use serde_json::{Map, Value};

/// Outcome of one connection attempt. Path impairments are data, not
/// errors: a refused or timed-out connect is a normal record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnState {
    Ok,
    Failed,
    Timeout,
    Skipped,
    Discard,
}

impl ConnState {
    fn code(self) -> u8 {
        match self {
            ConnState::Ok      => 0,
            ConnState::Failed  => 1,
            ConnState::Timeout => 2,
            ConnState::Skipped => 3,
            ConnState::Discard => 4,
        }
    }
}

impl Serialize for ConnState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ConnState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(ConnState::Ok),
            1 => Ok(ConnState::Failed),
            2 => Ok(ConnState::Timeout),
            3 => Ok(ConnState::Skipped),
            4 => Ok(ConnState::Discard),
            n => Err(D::Error::custom(format!("invalid spdr_state {}", n))),
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// What the worker did for one (job, configuration) pair. The source
/// port is the locally chosen port observed at connect time; the merger
/// joins on (dip, sp).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnRecord {
    pub sp:         u16,
    pub spdr_state: ConnState,
    pub spdr_start: String,
    pub spdr_stop:  String,
    pub config:     usize,
    pub dip:        String,
    pub dp:         u16,
    #[serde(rename = "jobId")]
    pub job_id:     String,
    #[serde(flatten)]
    pub extra:      Map<String, Value>,
}

impl ConnRecord {
    pub fn new(sp: u16, state: ConnState) -> Self {
        Self {
            sp:         sp,
            spdr_state: state,
            spdr_start: String::new(),
            spdr_stop:  String::new(),
            config:     0,
            dip:        String::new(),
            dp:         0,
            job_id:     String::new(),
            extra:      Map::new(),
        }
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.extra.insert(key.to_owned(), value.into());
    }
}

/// One FlowRecord joined with one ConnRecord, as a flat JSON object.
/// Kept generic so plugins can read chain fields without the core
/// knowing their names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergedRecord(pub Map<String, Value>);

impl MergedRecord {
    pub fn observed(&self) -> bool {
        self.0.get("observed").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.0.get("jobId").and_then(Value::as_str)
    }

    pub fn config(&self) -> usize {
        self.0.get("config").and_then(Value::as_u64).unwrap_or(0) as usize
    }

    pub fn state(&self) -> Option<ConnState> {
        let v = self.0.get("spdr_state")?.clone();
        serde_json::from_value(v).ok()
    }

    pub fn ok(&self) -> bool {
        self.state() == Some(ConnState::Ok)
    }

    pub fn str_field<'a>(&'a self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn int_field(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }
}

pub fn utcnow() -> String {
    time::now_utc().rfc3339().to_string()
}

/// Standard connectivity verdict from the baseline and experimental
/// outcomes. With no experimental outcome the single-flow online/offline
/// form is produced.
pub fn combine_connectivity(prefix: &str, baseline: bool, experimental: Option<bool>) -> String {
    match experimental {
        None => match baseline {
            true  => format!("{}.connectivity.online", prefix),
            false => format!("{}.connectivity.offline", prefix),
        },
        Some(true) => match baseline {
            true  => format!("{}.connectivity.works", prefix),
            false => format!("{}.connectivity.transient", prefix),
        },
        Some(false) => match baseline {
            true  => format!("{}.connectivity.broken", prefix),
            false => format!("{}.connectivity.offline", prefix),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_codes() {
        let json = serde_json::to_string(&ConnState::Timeout).unwrap();
        assert_eq!(json, "2");
        let back: ConnState = serde_json::from_str("4").unwrap();
        assert_eq!(back, ConnState::Discard);
    }

    #[test]
    fn conn_record_roundtrip() {
        let mut rec = ConnRecord::new(41000, ConnState::Ok);
        rec.config = 1;
        rec.dip = "192.0.2.1".to_owned();
        rec.dp = 80;
        rec.job_id = "00000000000000ff".to_owned();
        rec.set("http_code", 200);

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["sp"], 41000);
        assert_eq!(v["spdr_state"], 0);
        assert_eq!(v["jobId"], "00000000000000ff");
        assert_eq!(v["http_code"], 200);
    }

    #[test]
    fn connectivity_tags() {
        assert_eq!(combine_connectivity("ecn", true, Some(true)),   "ecn.connectivity.works");
        assert_eq!(combine_connectivity("ecn", true, Some(false)),  "ecn.connectivity.broken");
        assert_eq!(combine_connectivity("ecn", false, Some(true)),  "ecn.connectivity.transient");
        assert_eq!(combine_connectivity("ecn", false, Some(false)), "ecn.connectivity.offline");
        assert_eq!(combine_connectivity("dscp", true, None),        "dscp.connectivity.online");
    }
}
