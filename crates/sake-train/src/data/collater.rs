//! Length-bucketed batch sampling with a leading device dimension.
//!
//! Every epoch, each length group is permuted and cut into batches of
//! `batch_size * n_devices` records; the batch order across groups is then
//! shuffled. A batch is reshaped to `[n_devices, batch_size, ...]` so that
//! device `d` (one rank of the process group) trains on slice `d`.

use candle_core::{DType, Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use super::dataset::{LengthGroup, MoleculeDataset};
use crate::error::{data_error, TrainResult};

/// Width of the species one-hot encoding.
pub const N_SPECIES: usize = 4;

/// One batch worth of record indices inside a length group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPointer {
    pub length: usize,
    pub indices: Vec<u32>,
}

/// Inputs for one device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, atoms, 4]` one-hot species.
    pub species: Tensor,
    /// `[batch, atoms, 3]`
    pub coords: Tensor,
    /// `[batch, 1]`
    pub targets: Tensor,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.coords.dims()[0]
    }

    pub fn n_atoms(&self) -> usize {
        self.coords.dims()[1]
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            species: self.species.to_device(device)?,
            coords: self.coords.to_device(device)?,
            targets: self.targets.to_device(device)?,
        })
    }
}

/// Inputs for every device, with a leading `n_devices` axis.
#[derive(Debug, Clone)]
pub struct ShardedBatch {
    /// `[n_devices, batch, atoms, 4]`
    pub species: Tensor,
    /// `[n_devices, batch, atoms, 3]`
    pub coords: Tensor,
    /// `[n_devices, batch, 1]`
    pub targets: Tensor,
}

impl ShardedBatch {
    pub fn n_devices(&self) -> usize {
        self.coords.dims()[0]
    }

    /// Slice out one device's batch.
    pub fn shard(&self, device_index: usize) -> Result<Batch> {
        Ok(Batch {
            species: self.species.get(device_index)?,
            coords: self.coords.get(device_index)?,
            targets: self.targets.get(device_index)?,
        })
    }
}

/// One-hot encode integer indices along a new trailing axis.
///
/// Indices outside `0..depth` encode as all zeros.
pub fn one_hot(indices: &Tensor, depth: usize) -> Result<Tensor> {
    let classes = Tensor::arange(0i64, depth as i64, indices.device())?;
    indices
        .to_dtype(DType::I64)?
        .unsqueeze(indices.rank())?
        .broadcast_eq(&classes)?
        .to_dtype(DType::F32)
}

/// Builds randomized, device-sharded batches from a [`MoleculeDataset`].
#[derive(Debug, Clone)]
pub struct Collater {
    dataset: MoleculeDataset,
    batch_size: usize,
    n_devices: usize,
}

impl Collater {
    pub fn new(dataset: MoleculeDataset, batch_size: usize, n_devices: usize) -> TrainResult<Self> {
        if batch_size == 0 || n_devices == 0 {
            return Err(data_error(format!(
                "batch_size ({}) and n_devices ({}) must be positive",
                batch_size, n_devices
            )));
        }
        Ok(Self {
            dataset,
            batch_size,
            n_devices,
        })
    }

    pub fn dataset(&self) -> &MoleculeDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn n_devices(&self) -> usize {
        self.n_devices
    }

    /// Records consumed by one batch across all devices.
    pub fn global_batch_size(&self) -> usize {
        self.batch_size * self.n_devices
    }

    /// Target mean and standard deviation, used to rescale model outputs.
    pub fn get_statistics(&self) -> TrainResult<(f64, f64)> {
        self.dataset.statistics()
    }

    fn batches_in(&self, group: &LengthGroup) -> usize {
        group.len() / self.global_batch_size()
    }

    /// Number of batches in every epoch.
    pub fn len(&self) -> usize {
        self.dataset.groups().map(|(_, g)| self.batches_in(g)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Draw this epoch's batches.
    ///
    /// Records left over after the last full batch of a group are skipped for
    /// the epoch; no index repeats.
    pub fn get_pointers<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<BatchPointer> {
        let global = self.global_batch_size();
        let mut pointers = Vec::with_capacity(self.len());

        for (length, group) in self.dataset.groups() {
            let n_batches = self.batches_in(group);
            if n_batches == 0 {
                continue;
            }
            let mut perm: Vec<u32> = (0..group.len() as u32).collect();
            perm.shuffle(rng);
            perm.truncate(n_batches * global);

            pointers.extend(perm.chunks_exact(global).map(|chunk| BatchPointer {
                length,
                indices: chunk.to_vec(),
            }));
        }

        pointers.shuffle(rng);
        pointers
    }

    fn lookup(&self, pointer: &BatchPointer) -> TrainResult<&LengthGroup> {
        let group = self
            .dataset
            .group(pointer.length)
            .ok_or_else(|| data_error(format!("no group of length {}", pointer.length)))?;
        if pointer.indices.len() != self.global_batch_size() {
            return Err(data_error(format!(
                "pointer holds {} indices, expected {}",
                pointer.indices.len(),
                self.global_batch_size()
            )));
        }
        if let Some(&bad) = pointer.indices.iter().find(|&&i| i as usize >= group.len()) {
            return Err(data_error(format!(
                "index {} out of range for group of length {} ({} records)",
                bad,
                pointer.length,
                group.len()
            )));
        }
        Ok(group)
    }

    fn gather(group: &LengthGroup, indices: &[u32]) -> Result<(Tensor, Tensor, Tensor)> {
        let ids = Tensor::from_slice(indices, indices.len(), group.species.device())?;
        let species = one_hot(&group.species.index_select(&ids, 0)?, N_SPECIES)?;
        let coords = group.coords.index_select(&ids, 0)?;
        let targets = group.targets.index_select(&ids, 0)?.unsqueeze(1)?;
        Ok((species, coords, targets))
    }

    /// Materialize a batch for all devices.
    pub fn get_from_pointer(&self, pointer: &BatchPointer) -> TrainResult<ShardedBatch> {
        let group = self.lookup(pointer)?;
        let (species, coords, targets) = Self::gather(group, &pointer.indices)?;
        let (nd, bs, atoms) = (self.n_devices, self.batch_size, pointer.length);

        Ok(ShardedBatch {
            species: species.reshape((nd, bs, atoms, N_SPECIES))?,
            coords: coords.reshape((nd, bs, atoms, 3))?,
            targets: targets.reshape((nd, bs, 1))?,
        })
    }

    /// Materialize only the slice for `device_index`.
    pub fn get_shard(&self, pointer: &BatchPointer, device_index: usize) -> TrainResult<Batch> {
        if device_index >= self.n_devices {
            return Err(data_error(format!(
                "device index {} out of range for {} devices",
                device_index, self.n_devices
            )));
        }
        let group = self.lookup(pointer)?;
        let start = device_index * self.batch_size;
        let slice = &pointer.indices[start..start + self.batch_size];
        let (species, coords, targets) = Self::gather(group, slice)?;
        Ok(Batch {
            species,
            coords,
            targets,
        })
    }

    /// Iterate one epoch of full sharded batches.
    pub fn epoch<R: Rng + ?Sized>(&self, rng: &mut R) -> Epoch<'_> {
        Epoch {
            collater: self,
            pointers: self.get_pointers(rng),
        }
    }

    /// Iterate one epoch of this rank's shards, placed on `device`.
    pub fn epoch_for_rank<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rank: usize,
        device: &Device,
    ) -> RankEpoch<'_> {
        RankEpoch {
            collater: self,
            pointers: self.get_pointers(rng),
            rank,
            device: device.clone(),
        }
    }
}

/// Pops pointers from the back until the epoch is exhausted.
pub struct Epoch<'a> {
    collater: &'a Collater,
    pointers: Vec<BatchPointer>,
}

impl Epoch<'_> {
    pub fn remaining(&self) -> usize {
        self.pointers.len()
    }
}

impl Iterator for Epoch<'_> {
    type Item = TrainResult<ShardedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let pointer = self.pointers.pop()?;
        Some(self.collater.get_from_pointer(&pointer))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pointers.len(), Some(self.pointers.len()))
    }
}

/// Like [`Epoch`] but yields a single rank's slice.
pub struct RankEpoch<'a> {
    collater: &'a Collater,
    pointers: Vec<BatchPointer>,
    rank: usize,
    device: Device,
}

impl RankEpoch<'_> {
    pub fn remaining(&self) -> usize {
        self.pointers.len()
    }
}

impl Iterator for RankEpoch<'_> {
    type Item = TrainResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let pointer = self.pointers.pop()?;
        Some(
            self.collater
                .get_shard(&pointer, self.rank)
                .and_then(|b| Ok(b.to_device(&self.device)?)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pointers.len(), Some(self.pointers.len()))
    }
}
