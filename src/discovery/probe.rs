use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use log::{debug, trace};

use crate::protocol::thread::WorkerPool;

use super::ServerEntry;

const PROBE_DATAGRAM: &[u8] = b"PWSPROBE\r\n";

/// How one candidate is tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Straight TCP connect; used for local and caller-provided servers.
    Connect,
    /// UDP datagram first, TCP connect if the datagram is refused.
    Datagram,
}

/// One candidate in a tier race.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: ServerEntry,
    pub addr: SocketAddr,
    pub kind: ProbeKind,
}

/// The candidate that answered first.
#[derive(Debug)]
pub struct Resolved {
    pub entry: ServerEntry,
    pub addr: SocketAddr,
    /// Present when the winner answered a TCP connect.
    pub stream: Option<TcpStream>,
}

enum Answer {
    Reached(Resolved),
    Failed,
}

/// Probes every candidate at once and returns the first to answer within
/// `budget`. The pool starts every probe immediately, however many are
/// already running. Losers are closed when they finish: their result is dropped
/// with the receiving end of the channel.
pub fn race(pool: &WorkerPool, candidates: Vec<Candidate>, budget: Duration) -> Option<Resolved> {
    if candidates.is_empty() {
        return None;
    }

    let deadline = Instant::now() + budget;
    let done = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let mut outstanding = 0;

    for candidate in candidates {
        let tx = tx.clone();
        let done = Arc::clone(&done);
        let queued = pool.execute(move || {
            if done.load(Ordering::Acquire) {
                return;
            }
            let answer = match probe(&candidate, budget) {
                Ok(stream) => Answer::Reached(Resolved {
                    entry: candidate.entry,
                    addr: candidate.addr,
                    stream,
                }),
                Err(e) => {
                    trace!("probe {} failed: {e}", candidate.addr);
                    Answer::Failed
                }
            };
            let _ = tx.send(answer);
        });
        if queued {
            outstanding += 1;
        }
    }
    drop(tx);

    while outstanding > 0 {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match rx.recv_timeout(left) {
            Ok(Answer::Reached(winner)) => {
                done.store(true, Ordering::Release);
                debug!("probe winner {}", winner.addr);
                return Some(winner);
            }
            Ok(Answer::Failed) => outstanding -= 1,
            Err(_) => break,
        }
    }
    done.store(true, Ordering::Release);
    None
}

fn probe(candidate: &Candidate, timeout: Duration) -> io::Result<Option<TcpStream>> {
    match candidate.kind {
        ProbeKind::Connect => connect(candidate.addr, timeout).map(Some),
        ProbeKind::Datagram => match datagram(candidate.addr, timeout) {
            Ok(()) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                trace!("{} refused datagram; trying TCP", candidate.addr);
                connect(candidate.addr, timeout).map(Some)
            }
            Err(e) => Err(e),
        },
    }
}

fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    TcpStream::connect_timeout(&addr, timeout)
}

/// Any reply datagram counts as an answer.
fn datagram(addr: SocketAddr, timeout: Duration) -> io::Result<()> {
    let local: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind((local, 0))?;
    socket.connect(addr)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.send(PROBE_DATAGRAM)?;

    let mut buf = [0_u8; 64];
    socket.recv(&mut buf).map(|_| ())
}

/// Per-tier wait: the base budget split across candidates, never below the
/// tier's floor.
pub fn tier_budget(base: Duration, floor: Duration, candidates: usize) -> Duration {
    let count = u32::try_from(candidates.max(1)).unwrap_or(u32::MAX);
    (base / count).max(floor)
}
