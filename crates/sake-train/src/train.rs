//! Data-parallel training loop.
//!
//! Every rank holds a full model replica. Each step a rank computes gradients on
//! its own shard of the global batch, the gradients are averaged across the
//! process group, and every replica applies the same optimizer update.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sake_comm::Communicator;
use tracing::{info, warn};

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::TrainConfig;
use crate::data::{Batch, Collater};
use crate::distributed::{average_gradients, broadcast_u64s, global_mean, gradient_norm, sync_parameters};
use crate::error::{checkpoint_error, config_error, TrainError, TrainResult};
use crate::logging::{self, StepMetrics};
use crate::model::{mae_loss, DenseSakeModel};
use crate::optim::OptimizerChain;

const RESTORE_NONE: u64 = 0;
const RESTORE_LOADED: u64 = 1;
const RESTORE_FAILED: u64 = 2;

/// Training statistics for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    /// Loss averaged across ranks.
    pub loss: f64,
    pub grad_norm: f64,
    pub lr: f64,
    pub samples_per_sec: f64,
}

/// Main trainer holding the model replica, optimizer and process group handle.
pub struct Trainer {
    pub model: DenseSakeModel,
    pub varmap: VarMap,
    optimizer: OptimizerChain,
    comm: Box<dyn Communicator>,
    pub config: TrainConfig,
    pub device: Device,
    pub global_step: usize,
    /// Epochs completed.
    pub epoch: usize,
    target_stats: Option<(f64, f64)>,
}

impl Trainer {
    /// Build a fresh replica. Parameters are broadcast from rank 0 so every
    /// replica starts identical.
    pub fn new(config: TrainConfig, device: Device, mut comm: Box<dyn Communicator>) -> TrainResult<Self> {
        config.check()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = DenseSakeModel::new(&config.model, vb)?;
        sync_parameters(comm.as_mut(), &varmap)?;

        let optimizer = OptimizerChain::from_config(varmap.all_vars(), &config)?;

        info!(
            rank = comm.rank(),
            world_size = comm.world_size(),
            params = config.param_count_estimate(),
            transforms = ?optimizer.transform_names(),
            "Trainer initialized"
        );

        Ok(Self {
            model,
            varmap,
            optimizer,
            comm,
            config,
            device,
            global_step: 0,
            epoch: 0,
            target_stats: None,
        })
    }

    /// Like [`new`](Self::new), then restore the newest checkpoint under
    /// `checkpoint_root` if rank 0 finds one. Other ranks never look at the
    /// directory, so it only has to exist on rank 0's filesystem.
    pub fn resume_or_new(
        config: TrainConfig,
        device: Device,
        comm: Box<dyn Communicator>,
        checkpoint_root: &Path,
    ) -> TrainResult<Self> {
        let mut trainer = Self::new(config, device, comm)?;
        let source = if trainer.rank() == 0 {
            checkpoint::latest_checkpoint(checkpoint_root)
        } else {
            Ok(None)
        };
        trainer.restore_from_root(source, checkpoint_root)?;
        Ok(trainer)
    }

    /// Load weights, counters and target statistics from a checkpoint directory.
    ///
    /// Collective: rank 0 reads `dir`, then its weights and counters are
    /// broadcast to every rank.
    pub fn restore(&mut self, dir: &Path) -> TrainResult<()> {
        let source = if self.rank() == 0 {
            Ok(Some(dir.to_path_buf()))
        } else {
            Ok(None)
        };
        self.restore_from_root(source, dir).map(|_| ())
    }

    /// Rank 0 loads `source`; the outcome is broadcast so every rank runs the
    /// same collectives. Returns whether a checkpoint was restored.
    fn restore_from_root(&mut self, source: TrainResult<Option<PathBuf>>, hint: &Path) -> TrainResult<bool> {
        let local = source.and_then(|found| match found {
            Some(dir) => self.load_local(&dir).map(|meta| Some((dir, meta))),
            None => Ok(None),
        });
        let header = match &local {
            Ok(Some((_, meta))) => [
                RESTORE_LOADED,
                meta.step as u64,
                meta.epoch as u64,
                meta.mean.to_bits(),
                meta.std.to_bits(),
            ],
            Ok(None) => [RESTORE_NONE, 0, 0, 0, 0],
            Err(_) => [RESTORE_FAILED, 0, 0, 0, 0],
        };
        let header = broadcast_u64s(self.comm.as_mut(), &header, 0)?;

        match header[0] {
            RESTORE_NONE => Ok(false),
            RESTORE_LOADED => {
                sync_parameters(self.comm.as_mut(), &self.varmap)?;
                self.global_step = header[1] as usize;
                self.epoch = header[2] as usize;
                self.target_stats = Some((f64::from_bits(header[3]), f64::from_bits(header[4])));
                let path = match &local {
                    Ok(Some((dir, _))) => dir.display().to_string(),
                    _ => format!("{} (via rank 0)", hint.display()),
                };
                logging::log_checkpoint_restore(self.rank(), self.global_step, self.epoch, &path);
                Ok(true)
            }
            _ => Err(match local {
                Err(e) => e,
                Ok(_) => checkpoint_error("rank 0 could not restore its checkpoint", hint),
            }),
        }
    }

    /// Read metadata and weights on this rank only.
    fn load_local(&mut self, dir: &Path) -> TrainResult<CheckpointMeta> {
        let meta = checkpoint::load_meta(dir)?;
        if meta.config.model != self.config.model {
            return Err(config_error(format!(
                "checkpoint {} was written for a different model architecture",
                dir.display()
            )));
        }
        checkpoint::restore_weights(&mut self.varmap, dir)?;
        Ok(meta)
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Target `(mean, std)` used to color model outputs.
    pub fn target_statistics(&self) -> Option<(f64, f64)> {
        self.target_stats
    }

    pub fn set_target_statistics(&mut self, mean: f64, std: f64) {
        self.target_stats = Some((mean, std));
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.optimizer.set_lr(lr);
    }

    /// One optimizer step on this rank's shard.
    ///
    /// Every rank must call this the same number of times per epoch.
    pub fn train_step(&mut self, batch: &Batch) -> TrainResult<StepStats> {
        let t0 = Instant::now();
        let (mean, std) = self.target_stats.unwrap_or((0.0, 1.0));

        let pred = self.model.predict(&batch.species, &batch.coords, mean, std)?;
        let loss = mae_loss(&pred, &batch.targets)?;
        let local_loss = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let mut grads = loss.backward()?;

        let t_comm = Instant::now();
        average_gradients(self.comm.as_mut(), &self.varmap, &mut grads)?;
        logging::log_collective(
            self.rank(),
            self.config.param_count_estimate(),
            t_comm.elapsed().as_secs_f64() * 1e3,
        );

        let grad_norm = gradient_norm(&self.varmap, &grads)?;
        self.optimizer.step(&mut grads)?;
        self.global_step += 1;

        let loss = global_mean(self.comm.as_mut(), local_loss)?;
        let elapsed = t0.elapsed().as_secs_f64().max(1e-9);
        let stats = StepStats {
            loss,
            grad_norm,
            lr: self.optimizer.learning_rate(),
            samples_per_sec: batch.batch_size() as f64 / elapsed,
        };

        if !loss.is_finite() || self.global_step % self.config.log_interval == 0 {
            logging::log_training_step(
                self.rank(),
                self.global_step,
                &StepMetrics {
                    loss: stats.loss,
                    learning_rate: stats.lr,
                    grad_norm: stats.grad_norm,
                    samples_per_sec: stats.samples_per_sec,
                },
            );
        }
        Ok(stats)
    }

    /// Train on one epoch of this rank's shards. Returns the mean loss, or
    /// `None` when no length group filled a global batch.
    ///
    /// Batch order is drawn from `seed + epoch`, identical on every rank.
    pub fn train_epoch(&mut self, collater: &Collater, epoch: usize) -> TrainResult<Option<f64>> {
        if collater.n_devices() != self.world_size() {
            return Err(config_error(format!(
                "collater shards over {} devices but the process group has {} ranks",
                collater.n_devices(),
                self.world_size()
            )));
        }
        if self.target_stats.is_none() {
            self.target_stats = Some(collater.get_statistics()?);
        }

        let t0 = Instant::now();
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
        let rank = self.rank();
        let device = self.device.clone();

        let mut total_loss = 0.0;
        let mut n_steps = 0;
        for batch in collater.epoch_for_rank(&mut rng, rank, &device) {
            let stats = self.train_step(&batch?)?;
            if !stats.loss.is_finite() && self.config.stop_on_divergence {
                return Err(TrainError::Divergence {
                    loss: stats.loss,
                    step: self.global_step,
                });
            }
            total_loss += stats.loss;
            n_steps += 1;
        }

        self.epoch = epoch + 1;
        let mean_loss = if n_steps > 0 {
            Some(total_loss / n_steps as f64)
        } else {
            warn!(rank = rank, epoch = epoch, "Epoch produced no full batches");
            None
        };
        logging::log_epoch(rank, epoch, n_steps, mean_loss, t0.elapsed().as_secs_f64());
        Ok(mean_loss)
    }

    /// Train from the current epoch up to `epochs`, checkpointing after each.
    /// Returns the mean loss of every epoch run.
    pub fn train_loop(
        &mut self,
        collater: &Collater,
        epochs: usize,
        checkpoint_root: Option<&Path>,
    ) -> TrainResult<Vec<Option<f64>>> {
        let start = self.epoch;
        if start >= epochs {
            info!(rank = self.rank(), epoch = start, "Nothing to do; target epoch already reached");
        }

        let mut losses = Vec::with_capacity(epochs.saturating_sub(start));
        for epoch in start..epochs {
            let loss = self.train_epoch(collater, epoch)?;
            if let Some(root) = checkpoint_root {
                self.save_checkpoint(root, loss)?;
            }
            losses.push(loss);
        }
        Ok(losses)
    }

    /// Rank 0 writes `<root>/checkpoint_<step>` and prunes old ones. Every rank
    /// then learns whether the write succeeded, so a failure stops all ranks
    /// at the same epoch.
    pub fn save_checkpoint(&mut self, root: &Path, loss: Option<f64>) -> TrainResult<Option<PathBuf>> {
        let dir = checkpoint::checkpoint_path(root, self.global_step);
        let saved = if self.rank() == 0 {
            let (mean, std) = self.target_stats.unwrap_or((0.0, 1.0));
            let meta = CheckpointMeta {
                config: self.config.clone(),
                epoch: self.epoch,
                step: self.global_step,
                loss,
                mean,
                std,
            };
            let keep = self.config.keep_checkpoints.max(1);
            checkpoint::save_checkpoint(&self.varmap, &meta, &dir).and_then(|()| {
                let removed = checkpoint::cleanup_old_checkpoints(root, keep)?;
                logging::log_checkpoint_save(0, self.global_step, &dir.display().to_string(), loss);
                if removed > 0 {
                    info!(removed = removed, keep = keep, "Cleaned old checkpoints");
                }
                Ok(Some(dir.clone()))
            })
        } else {
            Ok(None)
        };

        // doubles as the barrier; reached even when rank 0 failed
        let mut failed = [if saved.is_err() { 1.0f32 } else { 0.0 }];
        self.comm.all_reduce_sum(&mut failed)?;
        if failed[0] > 0.0 {
            return Err(match saved {
                Err(e) => e,
                Ok(_) => checkpoint_error(
                    format!("rank 0 failed to write the checkpoint for step {}", self.global_step),
                    &dir,
                ),
            });
        }
        saved
    }
}
