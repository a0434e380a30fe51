use serde_json::Value;
use crate::observer::{Chain, FlowRecord, PacketView};
use super::tcp::TCP_SYN;

/// Differentiated Services codepoint observations: the first TCP SYN
/// and the first data-bearing (or non-TCP) packet per direction.
pub struct DscpChain;

impl DscpChain {
    pub fn new() -> Self {
        DscpChain
    }

    fn extract(&self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        let dscp = pkt.dscp();

        if let Some(tcp) = pkt.tcp() {
            if tcp.get_flags() & TCP_SYN == TCP_SYN {
                let key = if rev { "dscp_mark_syn_rev" } else { "dscp_mark_syn_fwd" };
                if rec.unset(key) {
                    rec.set(key, dscp);
                }
                return true;
            }
            if pkt.tcp_payload_len() == 0 {
                return true;
            }
        }

        let key = if rev { "dscp_mark_data_rev" } else { "dscp_mark_data_fwd" };
        if rec.unset(key) {
            rec.set(key, dscp);
        }

        true
    }
}

impl Chain for DscpChain {
    fn new_flow(&mut self, rec: &mut FlowRecord, _pkt: &PacketView) -> bool {
        rec.set("dscp_mark_syn_fwd", Value::Null);
        rec.set("dscp_mark_syn_rev", Value::Null);
        rec.set("dscp_mark_data_fwd", Value::Null);
        rec.set("dscp_mark_data_rev", Value::Null);
        true
    }

    fn ip4(&mut self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        self.extract(rec, pkt, rev)
    }

    fn ip6(&mut self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        self.extract(rec, pkt, rev)
    }
}
