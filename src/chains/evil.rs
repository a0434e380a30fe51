use serde_json::Value;
use crate::observer::{Chain, FlowRecord, PacketView};
use super::tcp::TCP_SYN;

/// RFC 3514 reserved-flag observations, first TCP SYN and first
/// data-bearing packet per direction. IPv6 headers carry no such flag
/// so only the IPv4 hook is implemented.
pub struct EvilChain;

impl EvilChain {
    pub fn new() -> Self {
        EvilChain
    }
}

impl Chain for EvilChain {
    fn new_flow(&mut self, rec: &mut FlowRecord, _pkt: &PacketView) -> bool {
        rec.set("evilbit_syn_fwd", Value::Null);
        rec.set("evilbit_syn_rev", Value::Null);
        rec.set("evilbit_data_fwd", Value::Null);
        rec.set("evilbit_data_rev", Value::Null);
        true
    }

    fn ip4(&mut self, rec: &mut FlowRecord, pkt: &PacketView, rev: bool) -> bool {
        let evil = pkt.evil();

        if let Some(tcp) = pkt.tcp() {
            if tcp.get_flags() & TCP_SYN == TCP_SYN {
                let key = if rev { "evilbit_syn_rev" } else { "evilbit_syn_fwd" };
                if rec.unset(key) {
                    rec.set(key, evil);
                }
                return true;
            }
            if pkt.tcp_payload_len() == 0 {
                return true;
            }
        }

        let key = if rev { "evilbit_data_rev" } else { "evilbit_data_fwd" };
        if rec.unset(key) {
            rec.set(key, evil);
        }

        true
    }
}
