use pnet::packet::Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use crate::helpers::dns::parse_response;
use crate::observer::{Chain, FlowRecord, PacketView};

/// Watches for a well-formed DNS response in the reverse direction and
/// completes the flow once one arrives.
pub struct DnsChain;

impl DnsChain {
    pub fn new() -> Self {
        DnsChain
    }

    fn response(&self, rec: &mut FlowRecord, payload: &[u8], rev: bool) -> bool {
        if rev && parse_response(payload).is_some() {
            rec.set("dns_response_valid", true);
        }
        !rec.get_bool("dns_response_valid").unwrap_or(false)
    }
}

impl Chain for DnsChain {
    fn new_flow(&mut self, rec: &mut FlowRecord, _pkt: &PacketView) -> bool {
        rec.set("dns_response_valid", false);
        true
    }

    fn tcp(&mut self, rec: &mut FlowRecord, tcp: &TcpPacket, rev: bool) -> bool {
        // over TCP the message is preceded by a two-octet length
        let payload = tcp.payload();
        match payload.len() > 2 {
            true  => self.response(rec, &payload[2..], rev),
            false => true,
        }
    }

    fn udp(&mut self, rec: &mut FlowRecord, udp: &UdpPacket, rev: bool) -> bool {
        self.response(rec, udp.payload(), rev)
    }
}

#[cfg(test)]
mod test {
    use crate::helpers::dns::build_query;
    use crate::observer::{Chain, FlowRecord};
    use crate::observer::testpkt::*;
    use super::DnsChain;

    fn response_for(domain: &str) -> Vec<u8> {
        let mut msg = build_query(0x1234, domain);
        msg[2] |= 0x80; // QR bit
        msg
    }

    #[test]
    fn response_completes_flow() {
        let query = udp4(b("10.0.0.1"), b("192.0.2.53"), 41000, 53, 0xbeef,
                         &build_query(0x1234, "example.com"));
        let reply = udp4(b("192.0.2.53"), b("10.0.0.1"), 53, 41000, 0xbeef,
                         &response_for("example.com"));

        let mut chain = DnsChain::new();
        let mut rec = FlowRecord::new(&pkt(&query));
        chain.new_flow(&mut rec, &pkt(&query));

        assert!(chain.udp(&mut rec, &pkt(&query).udp().unwrap(), false));
        assert_eq!(rec.get_bool("dns_response_valid"), Some(false));

        assert!(!chain.udp(&mut rec, &pkt(&reply).udp().unwrap(), true));
        assert_eq!(rec.get_bool("dns_response_valid"), Some(true));
    }

    #[test]
    fn junk_is_not_a_response() {
        let junk = udp4(b("192.0.2.53"), b("10.0.0.1"), 53, 41000, 0xbeef, &[0xff; 5]);

        let mut chain = DnsChain::new();
        let mut rec = FlowRecord::new(&pkt(&junk));
        chain.new_flow(&mut rec, &pkt(&junk));

        assert!(chain.udp(&mut rec, &pkt(&junk).udp().unwrap(), true));
        assert_eq!(rec.get_bool("dns_response_valid"), Some(false));
    }
}
