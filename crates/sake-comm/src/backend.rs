use crate::error::CommResult;

/// Abstraction over a process group that can run collectives on `f32` buffers.
///
/// Every rank must call the same collectives in the same order with buffers of
/// the same length; backends pair calls up positionally.
pub trait Communicator: Send {
    /// Rank of this participant in `0..world_size`.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn world_size(&self) -> usize;

    /// In-place element-wise sum across all ranks.
    ///
    /// On return every rank holds the identical reduced buffer.
    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> CommResult<()>;

    /// Replace `buf` on every rank with the contents held by `root`.
    fn broadcast(&mut self, buf: &mut [f32], root: usize) -> CommResult<()> {
        if self.rank() != root {
            buf.iter_mut().for_each(|v| *v = 0.0);
        }
        self.all_reduce_sum(buf)
    }

    /// Block until every rank has reached the barrier.
    fn barrier(&mut self) -> CommResult<()> {
        let mut token = [1.0f32];
        self.all_reduce_sum(&mut token)
    }

    /// `all_reduce_sum` followed by division by the world size.
    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> CommResult<()> {
        self.all_reduce_sum(buf)?;
        let n = self.world_size() as f32;
        if n > 1.0 {
            buf.iter_mut().for_each(|v| *v /= n);
        }
        Ok(())
    }
}

/// A world of one. Every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&mut self, _buf: &mut [f32]) -> CommResult<()> {
        Ok(())
    }

    fn broadcast(&mut self, _buf: &mut [f32], _root: usize) -> CommResult<()> {
        Ok(())
    }
}

impl<C: Communicator + ?Sized> Communicator for Box<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> CommResult<()> {
        (**self).all_reduce_sum(buf)
    }

    fn broadcast(&mut self, buf: &mut [f32], root: usize) -> CommResult<()> {
        (**self).broadcast(buf, root)
    }

    fn barrier(&mut self) -> CommResult<()> {
        (**self).barrier()
    }
}
