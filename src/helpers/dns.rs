use std::io::{Read, Write};
use std::net::{Shutdown, UdpSocket};
use std::time::Duration;
use log::debug;
use crate::spider::{ConnRecord, ConnState, Job};
use super::tcp::connect_tcp_stream;

/// Encode a single A query for `domain` with recursion desired.
pub fn build_query(id: u16, domain: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(17 + domain.len());

    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    msg.extend_from_slice(&1u16.to_be_bytes());      // QDCOUNT
    msg.extend_from_slice(&[0; 6]);                  // AN/NS/AR

    for label in domain.trim_end_matches('.').split('.') {
        let label = label.as_bytes();
        msg.push(label.len().min(63) as u8);
        msg.extend_from_slice(&label[..label.len().min(63)]);
    }
    msg.push(0);

    msg.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    msg.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

    msg
}

#[derive(Debug)]
pub struct Response {
    pub id:      u16,
    pub rcode:   u8,
    pub answers: u16,
}

/// Validate a DNS response message: the header must parse, QR must be
/// set, and the question section must be well-formed. Anything less
/// is treated as no response at all.
pub fn parse_response(msg: &[u8]) -> Option<Response> {
    if msg.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([msg[0], msg[1]]);
    if msg[2] & 0x80 == 0 {
        return None;
    }

    let rcode = msg[3] & 0x0f;
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let answers = u16::from_be_bytes([msg[6], msg[7]]);

    let mut at = 12;
    for _ in 0..qdcount {
        at = skip_name(msg, at)?;
        at = at.checked_add(4)?;
        if at > msg.len() {
            return None;
        }
    }

    Some(Response { id, rcode, answers })
}

fn skip_name(msg: &[u8], mut at: usize) -> Option<usize> {
    loop {
        let len = *msg.get(at)? as usize;
        if len == 0 {
            return Some(at + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Some(at + 2);
        }
        at += 1 + len;
    }
}

/// One DNS query over UDP. A missing or malformed response is a
/// failure, not an error.
pub fn connect_dns_udp(job: &Job, timeout: Duration) -> ConnRecord {
    let domain = match &job.domain {
        Some(domain) => domain,
        None         => return ConnRecord::new(0, ConnState::Skipped),
    };

    let bind = match job.dip.contains(':') {
        true  => "[::]:0",
        false => "0.0.0.0:0",
    };

    let sock = match UdpSocket::bind(bind) {
        Ok(sock) => sock,
        Err(_)   => return ConnRecord::new(0, ConnState::Failed),
    };

    let sp = sock.local_addr().map(|a| a.port()).unwrap_or(0);
    let id = (sp ^ 0x5ca1) as u16;

    if sock.set_read_timeout(Some(timeout)).is_err() {
        return ConnRecord::new(sp, ConnState::Failed);
    }

    if sock.send_to(&build_query(id, domain), (job.dip.as_str(), job.dp)).is_err() {
        return ConnRecord::new(sp, ConnState::Failed);
    }

    let mut buf = [0u8; 4096];
    match sock.recv(&mut buf) {
        Ok(n) => match parse_response(&buf[..n]) {
            Some(resp) if resp.id == id => ConnRecord::new(sp, ConnState::Ok),
            _                           => ConnRecord::new(sp, ConnState::Failed),
        },
        Err(e) => {
            debug!("dns query to {} got no response: {}", job.dip, e);
            ConnRecord::new(sp, ConnState::Failed)
        }
    }
}

/// One DNS query over TCP, two-octet length prefix per RFC 1035.
pub fn connect_dns_tcp(job: &Job, timeout: Duration) -> ConnRecord {
    let domain = match &job.domain {
        Some(domain) => domain.clone(),
        None         => return ConnRecord::new(0, ConnState::Skipped),
    };

    let (mut rec, stream) = connect_tcp_stream(job, timeout);
    let mut stream = match stream {
        Some(stream) => stream,
        None         => return rec,
    };

    let id = (rec.sp ^ 0x5ca1) as u16;
    let query = build_query(id, &domain);

    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(&query);

    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    let ok = stream.write_all(&framed).is_ok() && {
        let mut len = [0u8; 2];
        match stream.read_exact(&mut len) {
            Ok(()) => {
                let want = u16::from_be_bytes(len) as usize;
                let mut buf = vec![0u8; want];
                stream.read_exact(&mut buf).is_ok()
                    && parse_response(&buf).map(|r| r.id == id).unwrap_or(false)
            }
            Err(_) => false,
        }
    };

    let _ = stream.shutdown(Shutdown::Both);

    if !ok {
        rec.spdr_state = ConnState::Failed;
    }
    rec
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_wire_format() {
        let q = build_query(0x1234, "example.com");

        assert_eq!(&q[0..2], &[0x12, 0x34]);
        assert_eq!(q[2], 0x01); // RD
        assert_eq!(&q[4..6], &[0, 1]);
        assert_eq!(q[12], 7);
        assert_eq!(&q[13..20], b"example");
        assert_eq!(q[20], 3);
        assert_eq!(&q[21..24], b"com");
        assert_eq!(q[24], 0);
        assert_eq!(&q[25..29], &[0, 1, 0, 1]);
    }

    #[test]
    fn response_must_have_qr() {
        let q = build_query(7, "example.com");
        assert!(parse_response(&q).is_none());

        let mut r = q.clone();
        r[2] |= 0x80;
        let resp = parse_response(&r).unwrap();
        assert_eq!(resp.id, 7);
        assert_eq!(resp.rcode, 0);
    }

    #[test]
    fn truncated_question_rejected() {
        let mut r = build_query(7, "example.com");
        r[2] |= 0x80;
        r.truncate(15);
        assert!(parse_response(&r).is_none());
    }

    #[test]
    fn compressed_name_accepted() {
        let mut msg = vec![0u8, 7, 0x80, 0, 0, 1, 0, 1, 0, 0, 0, 0];
        msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1]);
        assert!(parse_response(&msg).is_some());
    }
}
