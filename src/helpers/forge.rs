use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use anyhow::{anyhow, Result};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket};
use pnet::packet::Packet;
use pnet::transport::TransportChannelType::{Layer3, Layer4};
use pnet::transport::TransportProtocol::Ipv6;
use pnet::transport::transport_channel;
use crate::spider::Job;
use super::dns::build_query;

/// A packet a forge plugin built for one probe variant. For IPv4 the
/// data is a complete IP packet; for IPv6 it is the transport segment
/// and the kernel supplies the header.
pub struct ForgedPacket {
    pub data:  Vec<u8>,
    pub sp:    u16,
    pub dst:   IpAddr,
    pub proto: u8,
}

static PORT_SALT: AtomicU16 = AtomicU16::new(0);

/// An ephemeral-range source port. Forged packets bypass the kernel's
/// allocator so uniqueness is best-effort, like the original's random
/// choice.
pub fn random_port() -> u16 {
    let salt = PORT_SALT.fetch_add(1, Ordering::Relaxed);
    let ns = time::precise_time_ns();
    1024 + (((ns >> 10) as u16).wrapping_add(salt.wrapping_mul(9973)) % 64511)
}

/// The local address the kernel would route to `dst` from.
pub fn source_for(dst: IpAddr) -> Result<IpAddr> {
    let bind = match dst {
        IpAddr::V4(_) => "0.0.0.0:0",
        IpAddr::V6(_) => "[::]:0",
    };
    let sock = UdpSocket::bind(bind)?;
    sock.connect((dst, 53))?;
    Ok(sock.local_addr()?.ip())
}

pub fn forge_tcp_syn(job: &Job, sp: u16, evil: bool) -> Result<ForgedPacket> {
    let dst: IpAddr = job.dip.parse()?;
    let seg = tcp_syn_segment(sp, job.dp);
    forge(dst, IpNextHeaderProtocols::Tcp.0, sp, evil, seg)
}

pub fn forge_dns_udp(job: &Job, sp: u16, domain: &str, evil: bool) -> Result<ForgedPacket> {
    let dst: IpAddr = job.dip.parse()?;
    let payload = build_query(sp ^ 0x5ca1, domain);
    let seg = udp_segment(sp, job.dp, &payload);
    forge(dst, IpNextHeaderProtocols::Udp.0, sp, evil, seg)
}

fn forge(dst: IpAddr, proto: u8, sp: u16, evil: bool, seg: Vec<u8>) -> Result<ForgedPacket> {
    let data = match dst {
        IpAddr::V4(dst4) => {
            let src = match source_for(dst)? {
                IpAddr::V4(src) => src,
                IpAddr::V6(_)   => return Err(anyhow!("no IPv4 source address")),
            };
            ip4_packet(src, dst4, proto, evil, seg)?
        }
        // IPv6 has no evil bit; the header is left to the kernel
        IpAddr::V6(dst6) => {
            let src = match source_for(dst)? {
                IpAddr::V6(src) => src,
                IpAddr::V4(_)   => return Err(anyhow!("no IPv6 source address")),
            };
            l4_checksummed(src, dst6, proto, seg)?
        }
    };

    Ok(ForgedPacket { data, sp, dst, proto })
}

fn tcp_syn_segment(sp: u16, dp: u16) -> Vec<u8> {
    let mut seg = vec![0u8; 20];
    let mut tcp = MutableTcpPacket::new(&mut seg).unwrap();
    tcp.set_source(sp);
    tcp.set_destination(dp);
    tcp.set_sequence(0);
    tcp.set_data_offset(5);
    tcp.set_flags(0x02);
    tcp.set_window(65535);
    seg
}

fn udp_segment(sp: u16, dp: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 8 + payload.len()];
    let mut udp = MutableUdpPacket::new(&mut seg).unwrap();
    udp.set_source(sp);
    udp.set_destination(dp);
    udp.set_length(8 + payload.len() as u16);
    udp.set_payload(payload);
    seg
}

fn ip4_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, evil: bool, mut seg: Vec<u8>) -> Result<Vec<u8>> {
    match proto {
        6 => {
            let mut tcp = MutableTcpPacket::new(&mut seg)
                .ok_or_else(|| anyhow!("short tcp segment"))?;
            let sum = tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
            tcp.set_checksum(sum);
        }
        17 => {
            let mut udp = MutableUdpPacket::new(&mut seg)
                .ok_or_else(|| anyhow!("short udp segment"))?;
            let sum = udp::ipv4_checksum(&udp.to_immutable(), &src, &dst);
            udp.set_checksum(sum);
        }
        _ => (),
    }

    let mut buf = vec![0u8; 20 + seg.len()];
    {
        let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(20 + seg.len() as u16);
        ip.set_ttl(64);
        ip.set_flags(if evil { 0b100 } else { 0 });
        ip.set_next_level_protocol(pnet::packet::ip::IpNextHeaderProtocol(proto));
        ip.set_source(src);
        ip.set_destination(dst);
        ip.set_payload(&seg);
        let sum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(sum);
    }

    Ok(buf)
}

fn l4_checksummed(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, mut seg: Vec<u8>) -> Result<Vec<u8>> {
    match proto {
        6 => {
            let mut pkt = MutableTcpPacket::new(&mut seg)
                .ok_or_else(|| anyhow!("short tcp segment"))?;
            let sum = tcp::ipv6_checksum(&pkt.to_immutable(), &src, &dst);
            pkt.set_checksum(sum);
        }
        17 => {
            let mut pkt = MutableUdpPacket::new(&mut seg)
                .ok_or_else(|| anyhow!("short udp segment"))?;
            let sum = udp::ipv6_checksum(&pkt.to_immutable(), &src, &dst);
            pkt.set_checksum(sum);
        }
        _ => (),
    }
    Ok(seg)
}

/// Put a forged packet on the wire through a raw socket.
pub fn send(pkt: &ForgedPacket) -> Result<()> {
    match pkt.dst {
        IpAddr::V4(_) => {
            let proto = pnet::packet::ip::IpNextHeaderProtocol(pkt.proto);
            let (mut tx, _rx) = transport_channel(4096, Layer3(proto))?;
            let ip = pnet::packet::ipv4::Ipv4Packet::new(&pkt.data)
                .ok_or_else(|| anyhow!("short forged packet"))?;
            tx.send_to(ip, pkt.dst)?;
        }
        IpAddr::V6(_) => {
            let proto = pnet::packet::ip::IpNextHeaderProtocol(pkt.proto);
            let (mut tx, _rx) = transport_channel(4096, Layer4(Ipv6(proto)))?;
            match pkt.proto {
                6 => {
                    let seg = pnet::packet::tcp::TcpPacket::new(&pkt.data)
                        .ok_or_else(|| anyhow!("short forged segment"))?;
                    tx.send_to(seg, pkt.dst)?;
                }
                _ => {
                    let seg = pnet::packet::udp::UdpPacket::new(&pkt.data)
                        .ok_or_else(|| anyhow!("short forged segment"))?;
                    tx.send_to(seg, pkt.dst)?;
                }
            }
        }
    }
    Ok(())
}
