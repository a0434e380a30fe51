use crate::observer::{Chain, FlowRecord, PacketView};
use super::tcp::TCP_SYN;

const ECT_ZERO: u8 = 0x02;
const ECT_ONE:  u8 = 0x01;
const ECT_CE:   u8 = 0x03;

/// ECN codepoint observations per direction, split between TCP SYN
/// packets and data-bearing (or non-TCP) packets.
pub struct EcnChain;

impl EcnChain {
    pub fn new() -> Self {
        EcnChain
    }

    fn extract(&self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        let mark = match pkt.ecn() {
            ECT_ZERO => "ecn_ect0",
            ECT_ONE  => "ecn_ect1",
            ECT_CE   => "ecn_ce",
            _        => return true,
        };

        let kind = match pkt.tcp() {
            Some(tcp) if tcp.get_flags() & TCP_SYN == TCP_SYN => "syn",
            _ => "data",
        };

        let dir = if rev { "rev" } else { "fwd" };
        rec.set(&format!("{}_{}_{}", mark, kind, dir), true);

        true
    }
}

impl Chain for EcnChain {
    fn new_flow(&mut self, rec: &mut FlowRecord, _pkt: &PacketView) -> bool {
        for dir in &["fwd", "rev"] {
            for kind in &["syn", "data"] {
                for mark in &["ecn_ect0", "ecn_ect1", "ecn_ce"] {
                    rec.set(&format!("{}_{}_{}", mark, kind, dir), false);
                }
            }
        }
        true
    }

    fn ip4(&mut self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        self.extract(rec, pkt, rev)
    }

    fn ip6(&mut self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        self.extract(rec, pkt, rev)
    }
}

#[cfg(test)]
mod test {
    use crate::observer::{Chain, FlowRecord};
    use crate::observer::testpkt::*;
    use super::EcnChain;

    #[test]
    fn ect0_on_syn() {
        let syn = tcp4_tos(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0x02);

        let mut chain = EcnChain::new();
        let mut rec = FlowRecord::new(&pkt(&syn));
        chain.new_flow(&mut rec, &pkt(&syn));
        chain.ip4(&mut rec, &pkt(&syn), false);

        assert_eq!(rec.get_bool("ecn_ect0_syn_fwd"), Some(true));
        assert_eq!(rec.get_bool("ecn_ect0_data_fwd"), Some(false));
    }

    #[test]
    fn ce_on_reverse_data() {
        let seg = tcp4(b("192.0.2.1"), b("10.0.0.1"), 80, 41000, ACK, 0x03, &[1, 2]);

        let mut chain = EcnChain::new();
        let mut rec = FlowRecord::new(&pkt(&seg));
        chain.new_flow(&mut rec, &pkt(&seg));
        chain.ip4(&mut rec, &pkt(&seg), true);

        assert_eq!(rec.get_bool("ecn_ce_data_rev"), Some(true));
        assert_eq!(rec.get_bool("ecn_ce_syn_rev"), Some(false));
    }

    #[test]
    fn not_ect_records_nothing() {
        let seg = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, ACK, 0, &[]);

        let mut chain = EcnChain::new();
        let mut rec = FlowRecord::new(&pkt(&seg));
        chain.new_flow(&mut rec, &pkt(&seg));
        chain.ip4(&mut rec, &pkt(&seg), false);

        for (_, v) in rec.fields.iter() {
            assert_eq!(v, &serde_json::Value::from(false));
        }
    }

    #[test]
    fn v6_traffic_class() {
        let syn = tcp6(b6("2001:db8::1"), b6("2001:db8::2"), 41000, 80, SYN, 0x01);

        let mut chain = EcnChain::new();
        let mut rec = FlowRecord::new(&pkt(&syn));
        chain.new_flow(&mut rec, &pkt(&syn));
        chain.ip6(&mut rec, &pkt(&syn), false);

        assert_eq!(rec.get_bool("ecn_ect1_syn_fwd"), Some(true));
    }
}
