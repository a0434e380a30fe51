//! Synthetic frames for tests, assembled with pnet mutable packets.

use std::net::{Ipv4Addr, Ipv6Addr};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::MutableTcpPacket;
use super::decode::PacketView;

pub const FIN: u16 = 0x001;
pub const SYN: u16 = 0x002;
pub const RST: u16 = 0x004;
pub const ACK: u16 = 0x010;
pub const ECE: u16 = 0x040;
pub const CWR: u16 = 0x080;

pub fn b(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn b6(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

pub fn pkt(frame: &[u8]) -> PacketView {
    PacketView::new(0.0, frame).unwrap()
}

pub fn tcp_seg(sp: u16, dp: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 20 + payload.len()];
    {
        let mut tcp = MutableTcpPacket::new(&mut buf).unwrap();
        tcp.set_source(sp);
        tcp.set_destination(dp);
        tcp.set_sequence(1);
        tcp.set_data_offset(5);
        tcp.set_flags(flags);
        tcp.set_window(65535);
        tcp.set_payload(payload);
    }
    buf
}

pub fn udp_seg(sp: u16, dp: u16, cksum: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&sp.to_be_bytes());
    buf.extend_from_slice(&dp.to_be_bytes());
    buf.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&cksum.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn ip4_frame(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, tos: u8, evil: bool, l4: &[u8]) -> Vec<u8> {
    let mut ip = vec![0u8; 20 + l4.len()];
    {
        let mut hdr = MutableIpv4Packet::new(&mut ip).unwrap();
        hdr.set_version(4);
        hdr.set_header_length(5);
        hdr.set_total_length(20 + l4.len() as u16);
        hdr.set_ttl(64);
        hdr.set_dscp(tos >> 2);
        hdr.set_ecn(tos & 0x03);
        hdr.set_flags(if evil { 0b100 } else { 0 });
        hdr.set_next_level_protocol(IpNextHeaderProtocol(proto));
        hdr.set_source(src);
        hdr.set_destination(dst);
        hdr.set_payload(l4);
    }
    eth_frame(EtherTypes::Ipv4.0, &ip)
}

pub fn ip6_frame(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, tc: u8, l4: &[u8]) -> Vec<u8> {
    let mut ip = vec![0u8; 40 + l4.len()];
    {
        let mut hdr = MutableIpv6Packet::new(&mut ip).unwrap();
        hdr.set_version(6);
        hdr.set_traffic_class(tc);
        hdr.set_payload_length(l4.len() as u16);
        hdr.set_next_header(IpNextHeaderProtocol(proto));
        hdr.set_hop_limit(64);
        hdr.set_source(src);
        hdr.set_destination(dst);
        hdr.set_payload(l4);
    }
    eth_frame(EtherTypes::Ipv6.0, &ip)
}

fn eth_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 14 + payload.len()];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
        eth.set_ethertype(pnet::packet::ethernet::EtherType(ethertype));
        eth.set_payload(payload);
    }
    buf
}

pub fn tcp4(src: Ipv4Addr, dst: Ipv4Addr, sp: u16, dp: u16, flags: u16, tos: u8, payload: &[u8]) -> Vec<u8> {
    ip4_frame(src, dst, 6, tos, false, &tcp_seg(sp, dp, flags, payload))
}

pub fn tcp4_tos(src: Ipv4Addr, dst: Ipv4Addr, sp: u16, dp: u16, flags: u16, tos: u8) -> Vec<u8> {
    tcp4(src, dst, sp, dp, flags, tos, &[])
}

pub fn tcp4_evil(src: Ipv4Addr, dst: Ipv4Addr, sp: u16, dp: u16, flags: u16) -> Vec<u8> {
    ip4_frame(src, dst, 6, 0, true, &tcp_seg(sp, dp, flags, &[]))
}

pub fn tcp6(src: Ipv6Addr, dst: Ipv6Addr, sp: u16, dp: u16, flags: u16, tc: u8) -> Vec<u8> {
    ip6_frame(src, dst, 6, tc, &tcp_seg(sp, dp, flags, &[]))
}

pub fn udp4(src: Ipv4Addr, dst: Ipv4Addr, sp: u16, dp: u16, cksum: u16, payload: &[u8]) -> Vec<u8> {
    ip4_frame(src, dst, 17, 0, false, &udp_seg(sp, dp, cksum, payload))
}

pub fn udp4_evil(src: Ipv4Addr, dst: Ipv4Addr, sp: u16, dp: u16, payload: &[u8]) -> Vec<u8> {
    ip4_frame(src, dst, 17, 0, true, &udp_seg(sp, dp, 0xbeef, payload))
}

pub fn icmp4(src: Ipv4Addr, dst: Ipv4Addr, typ: u8, code: u8, rest: &[u8]) -> Vec<u8> {
    let mut l4 = vec![typ, code, 0, 0];
    l4.extend_from_slice(rest);
    ip4_frame(src, dst, 1, 0, false, &l4)
}

/// ICMP destination unreachable quoting the given IP packet. `quote`
/// is the raw IP packet (no ethernet header).
pub fn icmp4_unreachable(src: Ipv4Addr, dst: Ipv4Addr, quote: &[u8]) -> Vec<u8> {
    let mut rest = vec![0u8; 4];
    rest.extend_from_slice(quote);
    icmp4(src, dst, 3, 1, &rest)
}

pub fn icmp6_unreachable(src: Ipv6Addr, dst: Ipv6Addr, quote: &[u8]) -> Vec<u8> {
    let mut l4 = vec![1, 0, 0, 0, 0, 0, 0, 0];
    l4.extend_from_slice(quote);
    ip6_frame(src, dst, 58, 0, &l4)
}
