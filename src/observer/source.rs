use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use log::{debug, warn};
use pcap::{Active, Capture, Offline};
use pcap::Error::*;
use crate::spider::{FlowMsg, QUEUE_SLEEP};
use super::Observer;

const BUFFER_SIZE: i32 = 10_000_000;
const SNAPLEN: i32 = 256;

/// A packet source selected by URI: `int:<ifname>` for a live
/// interface, `pcap:<file>` for a trace replay. A bare name is treated
/// as an interface.
pub enum Source {
    Live(Capture<Active>),
    File(Capture<Offline>),
}

pub fn open_uri(uri: &str) -> Result<Source> {
    match uri.split_once(':') {
        Some(("int", dev))  => Ok(Source::Live(open_live(dev)?)),
        Some(("pcap", path)) => Ok(Source::File(Capture::from_file(path)?)),
        Some((scheme, _))   => Err(anyhow!("unsupported capture URI scheme '{}'", scheme)),
        None                => Ok(Source::Live(open_live(uri)?)),
    }
}

fn open_live(dev: &str) -> Result<Capture<Active>> {
    let mut cap = Capture::from_device(dev)?
        .buffer_size(BUFFER_SIZE)
        .timeout(QUEUE_SLEEP.as_millis() as i32)
        .snaplen(SNAPLEN)
        .promisc(true)
        .open()?;

    match cap.list_datalinks()?.into_iter().find(|lt| lt.0 == 1) {
        Some(linktype) => cap.set_datalink(linktype)?,
        None           => return Err(anyhow!("link {} not ethernet", dev)),
    }

    Ok(cap)
}

impl Source {
    /// Pull one packet into the observer. Ok(false) once the capture is
    /// exhausted; read timeouts return Ok(true) so the caller can poll
    /// its interrupt flag.
    fn step(&mut self, observer: &mut Observer) -> Result<bool> {
        let next = match self {
            Source::Live(cap) => cap.next(),
            Source::File(cap) => cap.next(),
        };

        match next {
            Ok(packet) => {
                let ts = packet.header.ts.tv_sec as f64
                       + packet.header.ts.tv_usec as f64 * 1e-6;
                observer.packet(ts, packet.data);
                Ok(true)
            }
            Err(TimeoutExpired) => Ok(true),
            Err(NoMorePackets)  => Ok(false),
            Err(e)              => Err(e.into()),
        }
    }
}

/// Drive the observer until the capture is exhausted or the interrupt
/// fires, then flush everything left and push the shutdown marker. The
/// sink is bounded; once the interrupt has fired no send blocks for
/// more than a tick.
pub fn run_enqueuer(mut observer: Observer, mut source: Source,
                    sink: &Sender<FlowMsg>, interrupt: &Arc<AtomicBool>) -> Result<()> {
    while !interrupt.load(Ordering::Acquire) {
        if !source.step(&mut observer)? {
            break;
        }
        if !drain(&mut observer, sink, interrupt) {
            break;
        }
    }

    observer.flush();
    drain(&mut observer, sink, interrupt);
    observer.log_stats();

    loop {
        match sink.send_timeout(FlowMsg::Shutdown, QUEUE_SLEEP) {
            Ok(())                                          => break,
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => continue,
            Err(_)                                          => {
                warn!("flow queue gone before shutdown marker");
                break;
            }
        }
    }

    debug!("observer enqueuer finished");

    Ok(())
}

fn drain(observer: &mut Observer, sink: &Sender<FlowMsg>, interrupt: &Arc<AtomicBool>) -> bool {
    while let Some(rec) = observer.next_emitted() {
        let mut msg = FlowMsg::Flow(rec);
        loop {
            match sink.send_timeout(msg, QUEUE_SLEEP) {
                Ok(()) => break,
                Err(crossbeam_channel::SendTimeoutError::Timeout(back)) => {
                    if interrupt.load(Ordering::Acquire) {
                        return false;
                    }
                    msg = back;
                }
                Err(_) => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use anyhow::Result;
    use crossbeam_channel::bounded;
    use crate::chains::{BasicChain, TcpChain};
    use crate::observer::Observer;
    use crate::observer::testpkt::*;
    use crate::spider::FlowMsg;
    use super::*;

    // classic pcap format, ethernet linktype, native endianness
    fn write_fixture(path: &std::path::Path, frames: &[(f64, Vec<u8>)]) -> Result<()> {
        let mut out = Vec::new();

        out.extend_from_slice(&0xa1b2c3d4u32.to_ne_bytes());
        out.extend_from_slice(&2u16.to_ne_bytes());
        out.extend_from_slice(&4u16.to_ne_bytes());
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&65535u32.to_ne_bytes());
        out.extend_from_slice(&1u32.to_ne_bytes());

        for (ts, frame) in frames {
            out.extend_from_slice(&(*ts as u32).to_ne_bytes());
            out.extend_from_slice(&(((*ts % 1.0) * 1e6) as u32).to_ne_bytes());
            out.extend_from_slice(&(frame.len() as u32).to_ne_bytes());
            out.extend_from_slice(&(frame.len() as u32).to_ne_bytes());
            out.extend_from_slice(frame);
        }

        std::fs::write(path, out)?;

        Ok(())
    }

    #[test]
    fn pcap_replay_roundtrip() -> Result<()> {
        let path = std::env::temp_dir().join("pathprobe-replay-test.pcap");

        let frames = vec![
            (1000.0, tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, SYN, 0, &[])),
            (1000.1, tcp4(b("192.0.2.1"), b("10.0.0.1"), 80, 41000, SYN | ACK, 0, &[])),
            (1000.2, tcp4(b("10.0.0.1"), b("192.0.2.1"), 41000, 80, ACK, 0, &[])),
        ];
        write_fixture(&path, &frames)?;

        let chains: Vec<Box<dyn crate::observer::Chain>> =
            vec![Box::new(BasicChain::new()), Box::new(TcpChain::new())];
        let observer = Observer::new(chains);

        let uri = format!("pcap:{}", path.display());
        let source = open_uri(&uri)?;

        let (tx, rx) = bounded(16);
        let interrupt = Arc::new(AtomicBool::new(false));
        run_enqueuer(observer, source, &tx, &interrupt)?;

        let mut flows = Vec::new();
        loop {
            match rx.recv()? {
                FlowMsg::Flow(rec) => flows.push(rec),
                FlowMsg::Shutdown  => break,
            }
        }

        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].pkt_fwd, 2);
        assert_eq!(flows[0].pkt_rev, 1);
        assert_eq!(flows[0].get_bool("tcp_connected"), Some(true));

        Ok(())
    }

    #[test]
    fn empty_capture_only_sentinel() -> Result<()> {
        let path = std::env::temp_dir().join("pathprobe-empty-test.pcap");
        write_fixture(&path, &[])?;

        let observer = Observer::new(vec![Box::new(BasicChain::new())]);
        let source = open_uri(&format!("pcap:{}", path.display()))?;

        let (tx, rx) = bounded(16);
        let interrupt = Arc::new(AtomicBool::new(false));
        run_enqueuer(observer, source, &tx, &interrupt)?;

        match rx.recv()? {
            FlowMsg::Shutdown => (),
            _                 => panic!("expected only the shutdown marker"),
        }

        Ok(())
    }

    #[test]
    fn bad_scheme_rejected() {
        assert!(open_uri("ring:eth0").is_err());
    }
}
