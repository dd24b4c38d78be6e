//! Multi-process ring over TCP.
//!
//! Rank `r` listens on `peers[r]`, dials `peers[(r + 1) % n]` and accepts one
//! connection from its left neighbour. The dialling side opens with its rank as
//! a little-endian `u32` so the acceptor can verify the ring wiring.
//!
//! Frames are `[u64 element count][count x f32]`, all little-endian.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::backend::Communicator;
use crate::error::{CommError, CommResult, IoPeerExt};
use crate::ring::{ring_all_reduce, RingLink};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_FRAME_ELEMENTS: u64 = 1 << 31;

/// Ring communicator whose neighbours are other processes.
#[derive(Debug)]
pub struct TcpRing {
    rank: usize,
    world_size: usize,
    right: Option<TcpStream>,
    left: Option<TcpStream>,
}

impl TcpRing {
    /// Bind `peers[rank]` and join the ring, waiting up to `timeout` for both
    /// neighbours.
    pub fn connect(rank: usize, peers: &[SocketAddr], timeout: Duration) -> CommResult<Self> {
        let addr = *peers.get(rank).ok_or(CommError::InvalidRank {
            rank,
            world_size: peers.len(),
        })?;
        if peers.len() == 1 {
            return Ok(Self::single(rank));
        }
        let listener = TcpListener::bind(addr).with_peer(addr)?;
        Self::with_listener(rank, listener, peers, timeout)
    }

    /// Join the ring using an already bound listener for this rank.
    pub fn with_listener(
        rank: usize,
        listener: TcpListener,
        peers: &[SocketAddr],
        timeout: Duration,
    ) -> CommResult<Self> {
        let world_size = peers.len();
        if rank >= world_size {
            return Err(CommError::InvalidRank { rank, world_size });
        }
        if world_size == 1 {
            return Ok(Self::single(rank));
        }

        let right_rank = (rank + 1) % world_size;
        let left_rank = (rank + world_size - 1) % world_size;
        let right_addr = peers[right_rank];
        let deadline = Instant::now() + timeout;
        let timeout_secs = timeout.as_secs();

        let (right, left) = thread::scope(|s| {
            let dialer = s.spawn(move || dial(rank, right_addr, deadline, timeout_secs));
            let left = accept_from(&listener, left_rank, deadline, timeout_secs);
            let right = dialer
                .join()
                .map_err(|_| CommError::Protocol("dialer thread panicked".to_string()))?;
            Ok::<_, CommError>((right?, left?))
        })?;

        left.set_read_timeout(Some(timeout.max(Duration::from_secs(300))))
            .with_peer(format!("rank {}", left_rank))?;

        info!(
            rank = rank,
            world_size = world_size,
            right = %right_addr,
            "Joined TCP ring"
        );

        Ok(Self {
            rank,
            world_size,
            right: Some(right),
            left: Some(left),
        })
    }

    fn single(rank: usize) -> Self {
        Self {
            rank,
            world_size: 1,
            right: None,
            left: None,
        }
    }
}

fn dial(
    rank: usize,
    addr: SocketAddr,
    deadline: Instant,
    timeout_secs: u64,
) -> CommResult<TcpStream> {
    loop {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(mut stream) => {
                stream.set_nodelay(true).with_peer(addr)?;
                stream
                    .write_all(&(rank as u32).to_le_bytes())
                    .with_peer(addr)?;
                debug!(rank = rank, peer = %addr, "Connected to right neighbour");
                return Ok(stream);
            }
            Err(e) if Instant::now() < deadline => {
                debug!(peer = %addr, error = %e, "Right neighbour not ready, retrying");
                thread::sleep(RETRY_INTERVAL);
            }
            Err(_) => {
                return Err(CommError::Timeout {
                    secs: timeout_secs,
                    context: format!("connection to {}", addr),
                });
            }
        }
    }
}

fn accept_from(
    listener: &TcpListener,
    expected: usize,
    deadline: Instant,
    timeout_secs: u64,
) -> CommResult<TcpStream> {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "listener".to_string());
    listener.set_nonblocking(true).with_peer(&local)?;

    loop {
        match listener.accept() {
            Ok((mut stream, from)) => {
                stream.set_nonblocking(false).with_peer(from)?;
                stream.set_nodelay(true).with_peer(from)?;
                let remaining = deadline.saturating_duration_since(Instant::now());
                stream
                    .set_read_timeout(Some(remaining.max(RETRY_INTERVAL)))
                    .with_peer(from)?;

                let mut rank_buf = [0u8; 4];
                stream.read_exact(&mut rank_buf).with_peer(from)?;
                let actual = u32::from_le_bytes(rank_buf) as usize;
                if actual != expected {
                    return Err(CommError::Handshake { expected, actual });
                }
                debug!(peer = %from, rank = actual, "Accepted left neighbour");
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CommError::Timeout {
                        secs: timeout_secs,
                        context: format!("rank {} to connect to {}", expected, local),
                    });
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => return Err(CommError::Io { peer: local, source: e }),
        }
    }
}

pub(crate) fn encode_frame(data: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + data.len() * 4);
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for v in data {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub(crate) fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Vec<f32>> {
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf)?;
    let count = u64::from_le_bytes(len_buf);
    if count > MAX_FRAME_ELEMENTS {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} elements exceeds limit", count),
        ));
    }
    let mut payload = vec![0u8; count as usize * 4];
    reader.read_exact(&mut payload)?;
    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl RingLink for TcpRing {
    fn exchange(&mut self, outgoing: &[f32]) -> CommResult<Vec<f32>> {
        let rank = self.rank;
        let (right, left) = match (self.right.as_mut(), self.left.as_mut()) {
            (Some(r), Some(l)) => (r, l),
            _ => return Err(CommError::Disconnected(format!("rank {} has no ring links", rank))),
        };

        // Both neighbours send at the same time; writing on a separate thread
        // keeps a full socket buffer from stalling the whole ring.
        let frame = encode_frame(outgoing);
        thread::scope(|s| {
            let writer = s.spawn(move || {
                right.write_all(&frame)?;
                right.flush()
            });
            let incoming = read_frame(left).with_peer(format!("rank {} left link", rank));
            let sent = writer
                .join()
                .map_err(|_| CommError::Protocol("writer thread panicked".to_string()))?;
            sent.with_peer(format!("rank {} right link", rank))?;
            incoming
        })
    }
}

impl Communicator for TcpRing {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> CommResult<()> {
        let (rank, world_size) = (self.rank, self.world_size);
        ring_all_reduce(self, rank, world_size, buf)
    }
}
