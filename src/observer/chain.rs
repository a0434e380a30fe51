use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use super::decode::PacketView;
use super::flow::FlowRecord;

/// Per-flow analysis hook chain. The observer calls the hooks in a
/// fixed order for every packet of a flow: `new_flow` when the flow is
/// created, then `ip4`/`ip6`, then `icmp4`/`icmp6` where applicable,
/// then `tcp`/`udp`. Returning false from `new_flow` ignores the key
/// for good; returning false from any other hook completes the flow
/// after this packet and skips the remaining hooks.
///
/// Default implementations return true, so a chain implements only the
/// hooks it cares about; dispatch is a plain vtable call, there is no
/// per-packet capability probing.
pub trait Chain: Send {
    fn new_flow(&mut self, _rec: &mut FlowRecord, _pkt: &PacketView) -> bool {
        true
    }

    fn ip4(&mut self, _rec: &mut FlowRecord, _pkt: &PacketView, _rev: bool) -> bool {
        true
    }

    fn ip6(&mut self, _rec: &mut FlowRecord, _pkt: &PacketView, _rev: bool) -> bool {
        true
    }

    fn icmp4(&mut self, _rec: &mut FlowRecord, _pkt: &PacketView, _rev: bool) -> bool {
        true
    }

    fn icmp6(&mut self, _rec: &mut FlowRecord, _pkt: &PacketView, _rev: bool) -> bool {
        true
    }

    fn tcp(&mut self, _rec: &mut FlowRecord, _tcp: &TcpPacket, _rev: bool) -> bool {
        true
    }

    fn udp(&mut self, _rec: &mut FlowRecord, _udp: &UdpPacket, _rev: bool) -> bool {
        true
    }
}
