use std::net::IpAddr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use super::decode::{has_ports, PacketView};

/// Flow table key: the 5-tuple (or 3-tuple for portless protocols) as
/// a canonicalised byte string, smaller endpoint first, so both
/// directions of a conversation land on one entry. Which endpoint came
/// first in the packet is carried separately as the orientation bit.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FlowKey(Box<[u8]>);

impl FlowKey {
    /// Build the canonical key for a (src, dst) tuple. The returned
    /// bool is true when the source endpoint is the canonical first
    /// one, i.e. it encodes the packet's direction relative to the key.
    pub fn from_tuple(src: IpAddr, dst: IpAddr, proto: u8, sp: Option<u16>, dp: Option<u16>)
        -> (Self, bool)
    {
        let s = endpoint(src, sp);
        let d = endpoint(dst, dp);
        let src_first = s <= d;

        let (a, b) = match src_first {
            true  => (s, d),
            false => (d, s),
        };

        let mut key = Vec::with_capacity(2 + a.len() + b.len());
        key.push(if src.is_ipv4() { 4 } else { 6 });
        key.push(proto);
        key.extend_from_slice(&a);
        key.extend_from_slice(&b);

        (FlowKey(key.into_boxed_slice()), src_first)
    }
}

fn endpoint(addr: IpAddr, port: Option<u16>) -> Vec<u8> {
    let mut bytes = match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    };
    bytes.extend_from_slice(&port.unwrap_or(0).to_be_bytes());
    bytes
}

/// Key and orientation for a captured packet. ICMP error messages key
/// on the quoted packet with the orientation swapped, so they count as
/// reverse-direction evidence of the flow that triggered them. Returns
/// None when the headers needed for the key are truncated.
pub fn flow_key(pkt: &PacketView) -> Option<(FlowKey, bool)> {
    if let Some(q) = pkt.quote() {
        let (key, orient) = FlowKey::from_tuple(q.src, q.dst, q.proto, q.sport, q.dport);
        return Some((key, !orient));
    }

    let proto = pkt.proto();
    let (sp, dp) = match has_ports(proto) {
        true => {
            let (sp, dp) = pkt.ports();
            sp?;
            (sp, dp)
        }
        false => (None, None),
    };

    Some(FlowKey::from_tuple(pkt.src(), pkt.dst(), proto, sp, dp))
}

/// One bidirectional flow as the observer saw it. Core counters are
/// typed; chain-contributed annotations ride in `fields` and are
/// flattened into the emitted JSON object.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowRecord {
    pub sip:       String,
    pub dip:       String,
    pub sp:        Option<u16>,
    pub dp:        Option<u16>,
    pub proto:     u8,
    pub pkt_fwd:   u64,
    pub pkt_rev:   u64,
    pub oct_fwd:   u64,
    pub oct_rev:   u64,
    pub pkt_first: f64,
    pub pkt_last:  f64,
    #[serde(flatten)]
    pub fields:    Map<String, Value>,
}

impl FlowRecord {
    pub fn new(pkt: &PacketView) -> Self {
        let (sp, dp) = pkt.ports();
        Self {
            sip:       pkt.src().to_string(),
            dip:       pkt.dst().to_string(),
            sp:        sp,
            dp:        dp,
            proto:     pkt.proto(),
            pkt_fwd:   0,
            pkt_rev:   0,
            oct_fwd:   0,
            oct_rev:   0,
            pkt_first: pkt.ts,
            pkt_last:  pkt.ts,
            fields:    Map::new(),
        }
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.fields.insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    /// True when the field is absent or null, i.e. no chain has set a
    /// value for it yet.
    pub fn unset(&self, key: &str) -> bool {
        match self.fields.get(key) {
            None              => true,
            Some(Value::Null) => true,
            Some(_)           => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::observer::decode::PROTO_TCP;
    use crate::observer::testpkt::*;

    #[test]
    fn both_directions_one_key() {
        let syn = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0, &[]);
        let ack = tcp4(b("192.0.2.1"), b("10.0.0.1"), 80, 41000, SYN | ACK, 0, &[]);

        let fwd = flow_key(&pkt(&syn)).unwrap();
        let rev = flow_key(&pkt(&ack)).unwrap();

        assert_eq!(fwd.0, rev.0);
        assert_ne!(fwd.1, rev.1);
    }

    #[test]
    fn ports_distinguish_flows() {
        let one = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0, &[]);
        let two = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41001, 80, SYN, 0, &[]);

        assert_ne!(flow_key(&pkt(&one)).unwrap().0, flow_key(&pkt(&two)).unwrap().0);
    }

    #[test]
    fn quoted_icmp_is_reverse_evidence() {
        let syn = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0, &[]);
        let err = icmp4_unreachable(b("203.0.113.9"), b("10.0.0.1"), &syn[14..]);

        let fwd = flow_key(&pkt(&syn)).unwrap();
        let icmp = flow_key(&pkt(&err)).unwrap();

        assert_eq!(fwd.0, icmp.0);
        assert_ne!(fwd.1, icmp.1);
    }

    #[test]
    fn portless_key_is_three_tuple() {
        let echo = icmp4(b("10.0.0.1"), b("192.0.2.1"), 8, 0, &[0u8; 8]);
        let (key, _) = flow_key(&pkt(&echo)).unwrap();

        let reply = icmp4(b("192.0.2.1"), b("10.0.0.1"), 0, 0, &[0u8; 8]);
        let (rkey, _) = flow_key(&pkt(&reply)).unwrap();

        assert_eq!(key, rkey);
    }

    #[test]
    fn record_core_fields() {
        let syn = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0, &[]);
        let rec = FlowRecord::new(&pkt(&syn));

        assert_eq!(rec.sip, "10.0.0.1");
        assert_eq!(rec.dip, "192.0.2.1");
        assert_eq!(rec.sp, Some(41000));
        assert_eq!(rec.dp, Some(80));
        assert_eq!(rec.proto, PROTO_TCP);
    }
}
