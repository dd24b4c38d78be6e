pub mod collater;
pub mod dataset;

pub use collater::{one_hot, Batch, BatchPointer, Collater, Epoch, RankEpoch, ShardedBatch, N_SPECIES};
pub use dataset::{LengthGroup, MoleculeDataset};
