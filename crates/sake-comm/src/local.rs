//! In-process ring for thread-per-rank training.
//!
//! Each member owns the sending half of the channel to its right neighbour and
//! the receiving half of the channel from its left neighbour.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::backend::Communicator;
use crate::error::{CommError, CommResult};
use crate::ring::{ring_all_reduce, RingLink};

const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(300);

/// One member of an in-process communicator group.
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    right_tx: Sender<Vec<f32>>,
    left_rx: Receiver<Vec<f32>>,
    recv_timeout: Duration,
}

impl LocalGroup {
    /// Create a fully wired group of `world_size` members, indexed by rank.
    ///
    /// Move each member into the thread that plays that rank.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        // channel k carries frames from rank k to rank k + 1
        let (senders, mut receivers): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| unbounded::<Vec<f32>>()).unzip();
        // rank r reads the channel written by rank r - 1
        receivers.rotate_right(1);

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (right_tx, left_rx))| LocalGroup {
                rank,
                world_size,
                right_tx,
                left_rx,
                recv_timeout: DEFAULT_RECV_TIMEOUT,
            })
            .collect()
    }

    /// Fail a collective if the left neighbour is silent this long.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }
}

impl RingLink for LocalGroup {
    fn exchange(&mut self, outgoing: &[f32]) -> CommResult<Vec<f32>> {
        self.right_tx
            .send(outgoing.to_vec())
            .map_err(|_| CommError::Disconnected(format!("rank {} right link", self.rank)))?;

        match self.left_rx.recv_timeout(self.recv_timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CommError::Timeout {
                secs: self.recv_timeout.as_secs(),
                context: format!("rank {} left neighbour", self.rank),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CommError::Disconnected(format!(
                "rank {} left link",
                self.rank
            ))),
        }
    }
}

impl Communicator for LocalGroup {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F, T>(world_size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalGroup) -> T + Send + Sync + Copy + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalGroup::new(world_size)
            .into_iter()
            .map(|member| thread::spawn(move || f(member)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_reduce_sums_across_ranks() {
        let results = run_group(3, |mut comm| {
            let mut buf = vec![(comm.rank() + 1) as f32; 7];
            comm.all_reduce_sum(&mut buf).unwrap();
            buf
        });
        for buf in results {
            assert_eq!(buf, vec![6.0; 7]);
        }
    }

    #[test]
    fn test_all_reduce_buffer_smaller_than_world() {
        let results = run_group(4, |mut comm| {
            let mut buf = vec![comm.rank() as f32, 1.0];
            comm.all_reduce_sum(&mut buf).unwrap();
            buf
        });
        for buf in results {
            assert_eq!(buf, vec![6.0, 4.0]);
        }
    }

    #[test]
    fn test_all_reduce_mean_and_distinct_elements() {
        let results = run_group(2, |mut comm| {
            let r = comm.rank() as f32;
            let mut buf: Vec<f32> = (0..5).map(|i| i as f32 + 10.0 * r).collect();
            comm.all_reduce_mean(&mut buf).unwrap();
            buf
        });
        for buf in results {
            assert_eq!(buf, vec![5.0, 6.0, 7.0, 8.0, 9.0]);
        }
    }

    #[test]
    fn test_broadcast_from_root() {
        let results = run_group(3, |mut comm| {
            let mut buf = vec![comm.rank() as f32 + 0.5; 4];
            comm.broadcast(&mut buf, 1).unwrap();
            comm.barrier().unwrap();
            buf
        });
        for buf in results {
            assert_eq!(buf, vec![1.5; 4]);
        }
    }

    #[test]
    fn test_empty_buffer_is_noop() {
        let results = run_group(2, |mut comm| {
            let mut buf: Vec<f32> = Vec::new();
            comm.all_reduce_sum(&mut buf).unwrap();
            buf.len()
        });
        assert_eq!(results, vec![0, 0]);
    }

    #[test]
    fn test_dropped_peer_surfaces_error() {
        let mut members = LocalGroup::new(2);
        let mut survivor = members.remove(0).with_recv_timeout(Duration::from_millis(50));
        drop(members);
        let mut buf = vec![1.0f32, 2.0];
        assert!(survivor.all_reduce_sum(&mut buf).is_err());
    }
}
