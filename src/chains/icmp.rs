use crate::observer::{Chain, FlowRecord, PacketView};

/// ICMPv4 destination unreachable
pub const ICMP4_UNREACHABLE: u8 = 3;
/// ICMPv4 time exceeded
pub const ICMP4_TTLEXCEEDED: u8 = 11;
/// ICMPv6 destination unreachable
pub const ICMP6_UNREACHABLE: u8 = 1;
/// ICMPv6 time exceeded
pub const ICMP6_TTLEXCEEDED: u8 = 3;

/// Flags flows that drew an ICMP unreachable in the reverse direction
/// and completes them: once the path has said no there is nothing more
/// to see.
pub struct IcmpChain;

impl IcmpChain {
    pub fn new() -> Self {
        IcmpChain
    }
}

impl Chain for IcmpChain {
    fn new_flow(&mut self, rec: &mut FlowRecord, _pkt: &PacketView) -> bool {
        rec.set("icmp_unreachable", false);
        true
    }

    fn icmp4(&mut self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        if rev {
            if let Some(icmp) = pkt.icmp() {
                if icmp.get_icmp_type().0 == ICMP4_UNREACHABLE {
                    rec.set("icmp_unreachable", true);
                }
            }
        }
        !rec.get_bool("icmp_unreachable").unwrap_or(false)
    }

    fn icmp6(&mut self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        if rev {
            if let Some(icmp6) = pkt.icmp6() {
                if icmp6.get_icmpv6_type().0 == ICMP6_UNREACHABLE {
                    rec.set("icmp_unreachable", true);
                }
            }
        }
        !rec.get_bool("icmp_unreachable").unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use crate::observer::{Chain, FlowRecord};
    use crate::observer::testpkt::*;
    use super::IcmpChain;

    #[test]
    fn unreachable_completes_flow() {
        let syn = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0, &[]);
        let err = icmp4_unreachable(b("203.0.113.9"), b("10.0.0.1"), &syn[14..]);

        let mut chain = IcmpChain::new();
        let mut rec = FlowRecord::new(&pkt(&syn));
        chain.new_flow(&mut rec, &pkt(&syn));

        assert!(!chain.icmp4(&mut rec, &pkt(&err), true));
        assert_eq!(rec.get_bool("icmp_unreachable"), Some(true));
    }

    #[test]
    fn forward_unreachable_not_ours() {
        let syn = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0, &[]);
        let err = icmp4_unreachable(b("10.0.0.1"), b("203.0.113.9"), &syn[14..]);

        let mut chain = IcmpChain::new();
        let mut rec = FlowRecord::new(&pkt(&syn));
        chain.new_flow(&mut rec, &pkt(&syn));

        assert!(chain.icmp4(&mut rec, &pkt(&err), false));
        assert_eq!(rec.get_bool("icmp_unreachable"), Some(false));
    }
}
