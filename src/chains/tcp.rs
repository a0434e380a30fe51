use std::collections::HashMap;
use pnet::packet::Packet;
use pnet::packet::tcp::TcpPacket;
use crate::observer::{Chain, FlowRecord};

pub const TCP_FIN: u16 = 0x001;
pub const TCP_SYN: u16 = 0x002;
pub const TCP_RST: u16 = 0x004;
pub const TCP_PSH: u16 = 0x008;
pub const TCP_ACK: u16 = 0x010;
pub const TCP_URG: u16 = 0x020;
pub const TCP_ECE: u16 = 0x040;
pub const TCP_CWR: u16 = 0x080;

/// SYN and ACK
pub const TCP_SA: u16 = TCP_SYN | TCP_ACK;
/// SYN, ECE and CWR
pub const TCP_SEC: u16 = TCP_SYN | TCP_ECE | TCP_CWR;
/// SYN, ACK and ECE
pub const TCP_SAE: u16 = TCP_SYN | TCP_ACK | TCP_ECE;
/// SYN, ACK, ECE and CWR
pub const TCP_SAEC: u16 = TCP_SYN | TCP_ACK | TCP_ECE | TCP_CWR;

pub const TO_EOL: u8 = 0;
pub const TO_NOP: u8 = 1;
pub const TO_MSS: u8 = 2;
pub const TO_WS: u8 = 3;
pub const TO_SACKOK: u8 = 4;
pub const TO_TS: u8 = 8;
pub const TO_FASTOPEN: u8 = 34;

/// Walk the TCP options, returning a map of kind to payload bytes.
/// Tolerates NOP padding and stops at EOL or a malformed length.
pub fn tcp_options(tcp: &TcpPacket) -> HashMap<u8, Vec<u8>> {
    let data = tcp.packet();
    let end = (tcp.get_data_offset() as usize * 4).min(data.len());
    let mut opts = HashMap::new();
    let mut at = 20;

    while at < end {
        match data[at] {
            TO_NOP => {
                at += 1;
                continue;
            }
            TO_EOL => break,
            kind => {
                if at + 1 >= end {
                    break;
                }
                let len = data[at + 1] as usize;
                if len < 2 || at + len > end {
                    break;
                }
                opts.insert(kind, data[at + 2..at + len].to_vec());
                at += len;
            }
        }
    }

    opts
}

/// Basic TCP behaviour: first SYN flags per direction, 3WHS detection,
/// and flow completion on FIN in both directions or any RST.
pub struct TcpChain;

impl TcpChain {
    pub fn new() -> Self {
        TcpChain
    }
}

impl Chain for TcpChain {
    fn new_flow(&mut self, rec: &mut FlowRecord, _pkt: &crate::observer::PacketView) -> bool {
        rec.set("tcp_synflags_fwd", serde_json::Value::Null);
        rec.set("tcp_synflags_rev", serde_json::Value::Null);
        rec.set("tcp_fin_fwd", false);
        rec.set("tcp_fin_rev", false);
        rec.set("tcp_rst_fwd", false);
        rec.set("tcp_rst_rev", false);
        rec.set("tcp_connected", false);
        true
    }

    fn tcp(&mut self, rec: &mut FlowRecord, tcp: &TcpPacket, rev: bool) -> bool {
        let flags = tcp.get_flags();

        // first SYN wins
        if flags & TCP_SYN == TCP_SYN {
            let key = if rev { "tcp_synflags_rev" } else { "tcp_synflags_fwd" };
            if rec.unset(key) {
                rec.set(key, flags);
            }
        }

        if !rec.get_bool("tcp_connected").unwrap_or(false) && !rev
            && flags & TCP_ACK == TCP_ACK
        {
            let fwd = rec.get_u64("tcp_synflags_fwd");
            let rvs = rec.get_u64("tcp_synflags_rev");
            if let (Some(fwd), Some(rvs)) = (fwd, rvs) {
                if fwd as u16 & TCP_SYN == TCP_SYN && rvs as u16 & TCP_SA == TCP_SA {
                    rec.set("tcp_connected", true);
                }
            }
        }

        if flags & TCP_FIN == TCP_FIN {
            rec.set(if rev { "tcp_fin_rev" } else { "tcp_fin_fwd" }, true);
        }
        if flags & TCP_RST == TCP_RST {
            rec.set(if rev { "tcp_rst_rev" } else { "tcp_rst_fwd" }, true);
        }

        let fin_both = rec.get_bool("tcp_fin_fwd").unwrap_or(false)
                    && rec.get_bool("tcp_fin_rev").unwrap_or(false);
        let rst = rec.get_bool("tcp_rst_fwd").unwrap_or(false)
               || rec.get_bool("tcp_rst_rev").unwrap_or(false);

        !(fin_both || rst)
    }
}

#[cfg(test)]
mod test {
    use crate::observer::{Chain, FlowRecord};
    use crate::observer::testpkt::*;
    use super::*;

    fn run(chain: &mut TcpChain, rec: &mut FlowRecord, frame: &[u8], rev: bool) -> bool {
        let view = pkt(frame);
        let tcp = view.tcp().unwrap();
        chain.tcp(rec, &tcp, rev)
    }

    #[test]
    fn handshake_connects() {
        let syn = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, TCP_SYN, 0, &[]);
        let sa  = tcp4(b("192.0.2.1"), b("10.0.0.1"), 80, 41000, TCP_SA, 0, &[]);
        let ack = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, TCP_ACK, 0, &[]);

        let mut chain = TcpChain::new();
        let mut rec = FlowRecord::new(&pkt(&syn));
        chain.new_flow(&mut rec, &pkt(&syn));

        assert!(run(&mut chain, &mut rec, &syn, false));
        assert!(run(&mut chain, &mut rec, &sa, true));
        assert!(run(&mut chain, &mut rec, &ack, false));

        assert_eq!(rec.get_bool("tcp_connected"), Some(true));
        assert_eq!(rec.get_u64("tcp_synflags_rev"), Some(TCP_SA as u64));
    }

    #[test]
    fn first_syn_flags_kept() {
        let sec = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, TCP_SEC, 0, &[]);
        let syn = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, TCP_SYN, 0, &[]);

        let mut chain = TcpChain::new();
        let mut rec = FlowRecord::new(&pkt(&sec));
        chain.new_flow(&mut rec, &pkt(&sec));

        run(&mut chain, &mut rec, &sec, false);
        run(&mut chain, &mut rec, &syn, false);

        assert_eq!(rec.get_u64("tcp_synflags_fwd"), Some(TCP_SEC as u64));
    }

    #[test]
    fn fin_both_ways_completes() {
        let fin_f = tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, TCP_FIN | TCP_ACK, 0, &[]);
        let fin_r = tcp4(b("192.0.2.1"), b("10.0.0.1"), 80, 41000, TCP_FIN | TCP_ACK, 0, &[]);

        let mut chain = TcpChain::new();
        let mut rec = FlowRecord::new(&pkt(&fin_f));
        chain.new_flow(&mut rec, &pkt(&fin_f));

        assert!(run(&mut chain, &mut rec, &fin_f, false));
        assert!(!run(&mut chain, &mut rec, &fin_r, true));
    }

    #[test]
    fn rst_completes_immediately() {
        let rst = tcp4(b("192.0.2.1"), b("10.0.0.1"), 80, 41000, TCP_RST, 0, &[]);

        let mut chain = TcpChain::new();
        let mut rec = FlowRecord::new(&pkt(&rst));
        chain.new_flow(&mut rec, &pkt(&rst));

        assert!(!run(&mut chain, &mut rec, &rst, true));
        assert_eq!(rec.get_bool("tcp_rst_rev"), Some(true));
    }

    #[test]
    fn options_walker() {
        // MSS 1460, NOP, WS 7
        let mut seg = tcp_seg(41000, 80, TCP_SYN, &[]);
        seg.extend_from_slice(&[2, 4, 5, 180, 1, 3, 3, 7]);
        seg[12] = 7 << 4; // data offset: 28 bytes

        let tcp = pnet::packet::tcp::TcpPacket::new(&seg).unwrap();
        let opts = tcp_options(&tcp);

        assert_eq!(opts[&TO_MSS], vec![5, 180]);
        assert_eq!(opts[&TO_WS], vec![7]);
        assert!(!opts.contains_key(&TO_SACKOK));
    }
}
