use pnet::packet::udp::UdpPacket;
use serde_json::Value;
use crate::observer::{Chain, FlowRecord, PacketView};

/// Records whether the most recent UDP datagram in each direction had
/// its checksum disabled.
pub struct UdpChain;

impl UdpChain {
    pub fn new() -> Self {
        UdpChain
    }
}

impl Chain for UdpChain {
    fn new_flow(&mut self, rec: &mut FlowRecord, _pkt: &PacketView) -> bool {
        rec.set("udp_zero_checksum_fwd", Value::Null);
        rec.set("udp_zero_checksum_rev", Value::Null);
        true
    }

    fn udp(&mut self, rec: &mut FlowRecord, udp: &UdpPacket, rev: bool) -> bool {
        let key = if rev { "udp_zero_checksum_rev" } else { "udp_zero_checksum_fwd" };
        rec.set(key, udp.get_checksum() == 0);
        true
    }
}

#[cfg(test)]
mod test {
    use crate::observer::{Chain, FlowRecord};
    use crate::observer::testpkt::*;
    use super::UdpChain;

    #[test]
    fn zero_checksum_flagged() {
        let zero = udp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 53, 0, &[0; 12]);
        let ok   = udp4(b("192.0.2.1"), b("10.0.0.1"), 53, 41000, 0xbeef, &[0; 12]);

        let mut chain = UdpChain::new();
        let mut rec = FlowRecord::new(&pkt(&zero));
        chain.new_flow(&mut rec, &pkt(&zero));

        chain.udp(&mut rec, &pkt(&zero).udp().unwrap(), false);
        chain.udp(&mut rec, &pkt(&ok).udp().unwrap(), true);

        assert_eq!(rec.get_bool("udp_zero_checksum_fwd"), Some(true));
        assert_eq!(rec.get_bool("udp_zero_checksum_rev"), Some(false));
    }
}
