use std::io::{Read, Write};
use std::net::Shutdown;
use std::time::Duration;
use crate::spider::{ConnRecord, Job};
use super::tcp::connect_tcp_stream;

/// TCP connect plus one HTTP/1.1 GET. The connection outcome is the
/// measurement; the response status rides along in `http_code` when
/// one arrives.
pub fn connect_http(job: &Job, timeout: Duration) -> ConnRecord {
    let (mut rec, stream) = connect_tcp_stream(job, timeout);
    let mut stream = match stream {
        Some(stream) => stream,
        None         => return rec,
    };

    let host = job.domain.as_deref().unwrap_or(&job.dip);
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);

    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    if stream.write_all(request.as_bytes()).is_ok() {
        let mut buf = [0u8; 1024];
        if let Ok(n) = stream.read(&mut buf) {
            if let Some(code) = status_code(&buf[..n]) {
                rec.set("http_code", code);
            }
        }
    }

    let _ = stream.shutdown(Shutdown::Both);

    rec
}

fn status_code(response: &[u8]) -> Option<u16> {
    let line = response.split(|&b| b == b'\r').next()?;
    let line = std::str::from_utf8(line).ok()?;

    if !line.starts_with("HTTP/1.") {
        return None;
    }

    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::status_code;

    #[test]
    fn status_line_parsed() {
        assert_eq!(status_code(b"HTTP/1.1 200 OK\r\n\r\n"), Some(200));
        assert_eq!(status_code(b"HTTP/1.0 301 Moved Permanently\r\n"), Some(301));
        assert_eq!(status_code(b"SSH-2.0-OpenSSH_8.9\r\n"), None);
        assert_eq!(status_code(b""), None);
    }
}
