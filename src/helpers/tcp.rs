use std::mem;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::FromRawFd;
use std::time::Duration;
use log::debug;
use crate::spider::{ConnRecord, ConnState, Job};

pub enum Connect {
    Stream(TcpStream, u16),
    Timeout(u16),
    Failed,
}

/// Perform a TCP connection for a job and close it again. The wire
/// behaviour of the attempt is the measurement; the record only
/// carries the source port and the outcome.
pub fn connect_tcp(job: &Job, timeout: Duration) -> ConnRecord {
    let (rec, stream) = connect_tcp_stream(job, timeout);
    if let Some(stream) = stream {
        let _ = stream.shutdown(Shutdown::Both);
    }
    rec
}

/// Like `connect_tcp` but hands the connected stream back for helpers
/// that speak a protocol on top of it.
pub fn connect_tcp_stream(job: &Job, timeout: Duration) -> (ConnRecord, Option<TcpStream>) {
    let ip: IpAddr = match job.dip.parse() {
        Ok(ip)  => ip,
        Err(_)  => return (ConnRecord::new(0, ConnState::Failed), None),
    };

    match connect_timeout(&SocketAddr::new(ip, job.dp), timeout) {
        Connect::Stream(stream, sp) => (ConnRecord::new(sp, ConnState::Ok), Some(stream)),
        Connect::Timeout(sp)        => (ConnRecord::new(sp, ConnState::Timeout), None),
        Connect::Failed             => (ConnRecord::new(0, ConnState::Failed), None),
    }
}

/// Non-blocking connect so the ephemeral source port is known even
/// when the handshake times out; the merger needs it to pair the
/// attempt with the observed flow.
pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> Connect {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe {
        libc::socket(family, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    };
    if fd < 0 {
        return Connect::Failed;
    }

    let (storage, len) = sockaddr(addr);
    let rc = unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    };

    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            debug!("connect {} failed: {}", addr, err);
            unsafe { libc::close(fd) };
            return Connect::Failed;
        }
    }

    let sp = local_port(fd);

    let mut pfd = libc::pollfd {
        fd:      fd,
        events:  libc::POLLOUT,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };

    if ready == 0 {
        unsafe { libc::close(fd) };
        return Connect::Timeout(sp);
    }
    if ready < 0 {
        unsafe { libc::close(fd) };
        return Connect::Failed;
    }

    let mut soerr: libc::c_int = 0;
    let mut soerr_len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR,
                         &mut soerr as *mut _ as *mut libc::c_void, &mut soerr_len)
    };

    if rc != 0 || soerr != 0 {
        unsafe { libc::close(fd) };
        return Connect::Failed;
    }

    // back to blocking for anything layered on top
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
    }

    Connect::Stream(unsafe { TcpStream::from_raw_fd(fd) }, sp)
}

fn local_port(fd: libc::c_int) -> u16 {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return 0;
    }

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            u16::from_be(sin.sin_port)
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            u16::from_be(sin6.sin6_port)
        }
        _ => 0,
    }
}

fn sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}
