//! Ring all-reduce over an abstract neighbour link.
//!
//! Each rank talks only to its neighbours: it sends to `rank + 1` and receives
//! from `rank - 1` (mod world size). The buffer is split into `world_size`
//! chunks and reduced in two phases:
//!
//! 1. **Reduce-scatter**: after `n - 1` exchanges rank `r` owns the fully summed
//!    chunk `(r + 1) % n`.
//! 2. **All-gather**: `n - 1` more exchanges circulate the finished chunks.
//!
//! Each chunk is summed at exactly one place and then copied, so all ranks end
//! up bitwise identical.

use std::ops::Range;

use crate::error::{CommError, CommResult};

/// One rank's pair of ring connections.
pub trait RingLink {
    /// Send `outgoing` to the right neighbour while receiving the left
    /// neighbour's frame for the same step.
    fn exchange(&mut self, outgoing: &[f32]) -> CommResult<Vec<f32>>;
}

fn chunk_range(chunk: usize, chunk_size: usize, len: usize) -> Range<usize> {
    let start = (chunk * chunk_size).min(len);
    let end = (start + chunk_size).min(len);
    start..end
}

fn check_len(received: &[f32], expected: usize, chunk: usize) -> CommResult<()> {
    if received.len() != expected {
        return Err(CommError::Protocol(format!(
            "chunk {} has {} elements, expected {}",
            chunk,
            received.len(),
            expected
        )));
    }
    Ok(())
}

/// Sum `buf` element-wise across the ring in place.
pub fn ring_all_reduce<L: RingLink + ?Sized>(
    link: &mut L,
    rank: usize,
    world_size: usize,
    buf: &mut [f32],
) -> CommResult<()> {
    if rank >= world_size {
        return Err(CommError::InvalidRank { rank, world_size });
    }
    let n = world_size;
    if n == 1 {
        return Ok(());
    }

    let len = buf.len();
    let chunk_size = len.div_ceil(n);

    for step in 0..n - 1 {
        let send_chunk = (rank + n - step) % n;
        let recv_chunk = (rank + 2 * n - step - 1) % n;

        let outgoing = buf[chunk_range(send_chunk, chunk_size, len)].to_vec();
        let incoming = link.exchange(&outgoing)?;

        let range = chunk_range(recv_chunk, chunk_size, len);
        check_len(&incoming, range.len(), recv_chunk)?;
        for (dst, src) in buf[range].iter_mut().zip(incoming) {
            *dst += src;
        }
    }

    for step in 0..n - 1 {
        let send_chunk = (rank + 1 + n - step) % n;
        let recv_chunk = (rank + n - step) % n;

        let outgoing = buf[chunk_range(send_chunk, chunk_size, len)].to_vec();
        let incoming = link.exchange(&outgoing)?;

        let range = chunk_range(recv_chunk, chunk_size, len);
        check_len(&incoming, range.len(), recv_chunk)?;
        buf[range].copy_from_slice(&incoming);
    }

    Ok(())
}
