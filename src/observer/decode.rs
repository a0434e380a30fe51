use std::net::IpAddr;
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::icmpv6::Icmpv6Packet;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP:  u8 = 6;
pub const PROTO_UDP:  u8 = 17;
pub const PROTO_ICMP6: u8 = 58;
pub const PROTO_SCTP: u8 = 132;
pub const PROTO_DCCP: u8 = 33;

/// ICMPv4 types that quote the offending packet.
const ICMP4_QUOTING: [u8; 5] = [3, 4, 5, 11, 12];
/// ICMPv6 types that quote the offending packet.
const ICMP6_QUOTING: [u8; 4] = [1, 2, 3, 4];

pub fn has_ports(proto: u8) -> bool {
    proto == PROTO_TCP || proto == PROTO_UDP || proto == PROTO_SCTP || proto == PROTO_DCCP
}

pub enum IpHdr<'p> {
    V4(Ipv4Packet<'p>),
    V6(Ipv6Packet<'p>),
}

/// The IP header an ICMP error message quotes, reduced to what flow
/// identification needs.
#[derive(Copy, Clone, Debug)]
pub struct Quote {
    pub src:   IpAddr,
    pub dst:   IpAddr,
    pub proto: u8,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
}

/// One captured packet parsed down to its transport header, borrowed
/// from the capture buffer. Lookups are on the hot path so nothing is
/// copied out.
pub struct PacketView<'p> {
    pub ts: f64,
    ip:     IpHdr<'p>,
}

impl<'p> PacketView<'p> {
    /// Parse an ethernet frame, skipping one 802.1Q tag if present.
    /// Returns None for anything that is not IPv4 or IPv6.
    pub fn new(ts: f64, frame: &'p [u8]) -> Option<Self> {
        let eth = EthernetPacket::new(frame)?;
        let (ethertype, offset) = match eth.get_ethertype() {
            EtherTypes::Vlan => {
                let vlan = VlanPacket::new(&frame[14..])?;
                (vlan.get_ethertype(), 18)
            }
            other => (other, 14),
        };

        let ip = match ethertype {
            EtherTypes::Ipv4 => IpHdr::V4(Ipv4Packet::new(&frame[offset..])?),
            EtherTypes::Ipv6 => IpHdr::V6(Ipv6Packet::new(&frame[offset..])?),
            _                => return None,
        };

        match &ip {
            IpHdr::V4(v4) if v4.get_version() != 4 => return None,
            IpHdr::V6(v6) if v6.get_version() != 6 => return None,
            _ => (),
        }

        Some(Self { ts, ip })
    }

    pub fn is_v4(&self) -> bool {
        match self.ip {
            IpHdr::V4(_) => true,
            IpHdr::V6(_) => false,
        }
    }

    pub fn ipv4(&self) -> Option<&Ipv4Packet<'p>> {
        match &self.ip {
            IpHdr::V4(ip) => Some(ip),
            IpHdr::V6(_)  => None,
        }
    }

    pub fn src(&self) -> IpAddr {
        match &self.ip {
            IpHdr::V4(ip) => IpAddr::V4(ip.get_source()),
            IpHdr::V6(ip) => IpAddr::V6(ip.get_source()),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match &self.ip {
            IpHdr::V4(ip) => IpAddr::V4(ip.get_destination()),
            IpHdr::V6(ip) => IpAddr::V6(ip.get_destination()),
        }
    }

    pub fn proto(&self) -> u8 {
        match &self.ip {
            IpHdr::V4(ip) => ip.get_next_level_protocol().0,
            IpHdr::V6(ip) => ip.get_next_header().0,
        }
    }

    /// The ToS / traffic class octet: DSCP in the upper six bits, ECN
    /// in the lower two.
    pub fn traffic_class(&self) -> u8 {
        match &self.ip {
            IpHdr::V4(ip) => ip.get_dscp() << 2 | ip.get_ecn(),
            IpHdr::V6(ip) => ip.get_traffic_class(),
        }
    }

    pub fn dscp(&self) -> u8 {
        self.traffic_class() >> 2
    }

    pub fn ecn(&self) -> u8 {
        self.traffic_class() & 0x03
    }

    /// The RFC 3514 reserved flag. IPv6 has no equivalent.
    pub fn evil(&self) -> bool {
        match &self.ip {
            IpHdr::V4(ip) => ip.get_flags() & 0b100 != 0,
            IpHdr::V6(_)  => false,
        }
    }

    /// Total IP datagram length, independent of capture padding.
    pub fn size(&self) -> usize {
        match &self.ip {
            IpHdr::V4(ip) => ip.get_total_length() as usize,
            IpHdr::V6(ip) => ip.get_payload_length() as usize + 40,
        }
    }

    /// The transport header and payload, trimmed to the IP length so
    /// ethernet padding never leaks into parsers.
    pub fn transport(&self) -> &[u8] {
        match &self.ip {
            IpHdr::V4(ip) => {
                let hdr = ip.get_header_length() as usize * 4;
                let len = (ip.get_total_length() as usize).saturating_sub(hdr);
                let payload = ip.payload();
                &payload[..len.min(payload.len())]
            }
            IpHdr::V6(ip) => {
                let len = ip.get_payload_length() as usize;
                let payload = ip.payload();
                &payload[..len.min(payload.len())]
            }
        }
    }

    pub fn tcp(&self) -> Option<TcpPacket> {
        match self.proto() {
            PROTO_TCP => TcpPacket::new(self.transport()),
            _         => None,
        }
    }

    pub fn udp(&self) -> Option<UdpPacket> {
        match self.proto() {
            PROTO_UDP => UdpPacket::new(self.transport()),
            _         => None,
        }
    }

    pub fn icmp(&self) -> Option<IcmpPacket> {
        match (self.is_v4(), self.proto()) {
            (true, PROTO_ICMP) => IcmpPacket::new(self.transport()),
            _                  => None,
        }
    }

    pub fn icmp6(&self) -> Option<Icmpv6Packet> {
        match (self.is_v4(), self.proto()) {
            (false, PROTO_ICMP6) => Icmpv6Packet::new(self.transport()),
            _                    => None,
        }
    }

    /// TCP payload octets carried by this packet, from the IP and TCP
    /// header lengths rather than the capture length.
    pub fn tcp_payload_len(&self) -> usize {
        match self.tcp() {
            Some(tcp) => {
                let hdr = tcp.get_data_offset() as usize * 4;
                self.transport().len().saturating_sub(hdr)
            }
            None => 0,
        }
    }

    /// Source and destination ports, where the transport has them.
    pub fn ports(&self) -> (Option<u16>, Option<u16>) {
        let l4 = self.transport();
        if has_ports(self.proto()) && l4.len() >= 4 {
            let sp = u16::from_be_bytes([l4[0], l4[1]]);
            let dp = u16::from_be_bytes([l4[2], l4[3]]);
            (Some(sp), Some(dp))
        } else {
            (None, None)
        }
    }

    /// The quoted original header for ICMP error messages that carry
    /// one. Messages quoting less than a full IP header, or truncating
    /// the quoted ports, yield None.
    pub fn quote(&self) -> Option<Quote> {
        match &self.ip {
            IpHdr::V4(_) => {
                let icmp = self.icmp()?;
                if !ICMP4_QUOTING.contains(&icmp.get_icmp_type().0) {
                    return None;
                }
                // 4 octets of type-specific header before the quote
                let payload = self.transport();
                let q = payload.get(8..)?;
                if q.len() < 20 {
                    return None;
                }
                let ip = Ipv4Packet::new(q)?;
                let proto = ip.get_next_level_protocol().0;
                let hdr = ip.get_header_length() as usize * 4;
                let (sport, dport) = quoted_ports(proto, q.get(hdr..))?;
                Some(Quote {
                    src:   IpAddr::V4(ip.get_source()),
                    dst:   IpAddr::V4(ip.get_destination()),
                    proto: proto,
                    sport: sport,
                    dport: dport,
                })
            }
            IpHdr::V6(_) => {
                let icmp6 = self.icmp6()?;
                if !ICMP6_QUOTING.contains(&icmp6.get_icmpv6_type().0) {
                    return None;
                }
                let payload = self.transport();
                let q = payload.get(8..)?;
                if q.len() < 40 {
                    return None;
                }
                let ip = Ipv6Packet::new(q)?;
                let proto = ip.get_next_header().0;
                let (sport, dport) = quoted_ports(proto, q.get(40..))?;
                Some(Quote {
                    src:   IpAddr::V6(ip.get_source()),
                    dst:   IpAddr::V6(ip.get_destination()),
                    proto: proto,
                    sport: sport,
                    dport: dport,
                })
            }
        }
    }
}

fn quoted_ports(proto: u8, l4: Option<&[u8]>) -> Option<(Option<u16>, Option<u16>)> {
    if !has_ports(proto) {
        return Some((None, None));
    }

    match l4 {
        Some(l4) if l4.len() >= 4 => {
            let sp = u16::from_be_bytes([l4[0], l4[1]]);
            let dp = u16::from_be_bytes([l4[2], l4[3]]);
            Some((Some(sp), Some(dp)))
        }
        _ => None,
    }
}
