//! # SAKE Training Library
//!
//! Data-parallel training of a dense SAKE (spatial attention kinetic
//! network) regressor on molecular energies.
//!
//! ## Architecture Overview
//!
//! - **Data**: molecules are grouped by atom count; the [`data::Collater`]
//!   cuts each epoch into batches of `batch_size * n_devices` records and
//!   hands every rank its own slice
//! - **Model**: [`model::DenseSakeModel`] predicts per-atom contributions that
//!   are summed and rescaled to target units
//! - **Optimizer**: additive weight decay, element-wise clipping and NaN
//!   zeroing in front of Adam ([`optim::OptimizerChain`])
//! - **Distribution**: gradients are averaged with a ring all-reduce from
//!   `sake-comm` before every update, so replicas never drift apart
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sake_train::{config::TrainConfig, data::{Collater, MoleculeDataset}, train::Trainer};
//! use sake_comm::SingleProcess;
//! use candle_core::Device;
//!
//! # fn main() -> sake_train::error::TrainResult<()> {
//! let config = TrainConfig::tiny_cpu();
//! let dataset = MoleculeDataset::synthetic(&[3, 4, 5], 64, 0)?;
//! let collater = Collater::new(dataset, config.batch_size, 1)?;
//!
//! let mut trainer = Trainer::new(config, Device::Cpu, Box::new(SingleProcess))?;
//! let losses = trainer.train_loop(&collater, 3, None)?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod model;
pub mod optim;
pub mod train;
