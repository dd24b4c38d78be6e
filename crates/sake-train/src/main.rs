//! CLI entry point for sake-train.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sake_comm::{Communicator, LocalGroup, SingleProcess, TcpRing};
use sake_train::config::TrainConfig;
use sake_train::data::{Collater, MoleculeDataset};
use sake_train::error::{config_error, TrainResult};
use sake_train::logging::init_logging;
use sake_train::train::Trainer;

fn resolve_train_config(config: &str) -> Option<TrainConfig> {
    match config {
        "ani" | "dense-sake" | "dense_sake" => Some(TrainConfig::ani()),
        "tiny-cpu" | "tiny_cpu" => Some(TrainConfig::tiny_cpu()),
        _ => None,
    }
}

/// A preset name, or a path to a JSON config file.
fn load_train_config(config: &str) -> TrainResult<TrainConfig> {
    if let Some(cfg) = resolve_train_config(config) {
        return Ok(cfg);
    }
    let path = Path::new(config);
    if path.extension().is_some_and(|e| e == "json") {
        return TrainConfig::from_json_file(path);
    }
    Err(config_error(format!(
        "Unknown config: {}. Use ani, tiny-cpu, or a .json file.",
        config
    )))
}

fn resolve_device(device: &str) -> Result<candle_core::Device, String> {
    match device {
        "cpu" => Ok(candle_core::Device::Cpu),
        #[cfg(feature = "cuda")]
        "cuda" => candle_core::Device::new_cuda(0)
            .map_err(|e| format!("Failed to initialize CUDA device 0: {}", e)),
        #[cfg(feature = "cuda")]
        s if s.starts_with("cuda:") => {
            let id: usize = s["cuda:".len()..]
                .parse()
                .map_err(|_| format!("Invalid CUDA device id in '{}'", s))?;
            candle_core::Device::new_cuda(id)
                .map_err(|e| format!("Failed to initialize CUDA device {}: {}", id, e))
        }
        other => Err(format!("Unknown device: {}. Use 'cpu', 'cuda', or 'cuda:N'.", other)),
    }
}

fn parse_lengths(raw: &str) -> Result<Vec<usize>, String> {
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid molecule length '{}'", s))
        })
        .collect()
}

#[derive(Parser)]
#[command(
    name = "sake-train",
    about = "Data-parallel training of dense SAKE models on molecular energies"
)]
struct Cli {
    /// Emit JSON log lines instead of human-readable output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model, one process (or thread) per rank
    Train {
        /// Preset name (ani, tiny-cpu) or JSON config path
        #[arg(long, default_value = "ani")]
        config: String,

        /// `.npz` archive with i_<L>, x_<L>, y_<L> arrays
        #[arg(long)]
        data: Option<PathBuf>,

        /// Train on a generated dataset instead of --data
        #[arg(long)]
        synthetic: bool,

        #[arg(long)]
        epochs: Option<usize>,

        /// Records per rank per step
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        lr: Option<f64>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value = "_checkpoint")]
        checkpoint_dir: PathBuf,

        /// Ignore existing checkpoints
        #[arg(long)]
        no_resume: bool,

        #[arg(long, env = "SAKE_RANK", default_value = "0")]
        rank: usize,

        #[arg(long, env = "SAKE_WORLD_SIZE", default_value = "1")]
        world_size: usize,

        /// Listen address of every rank, in rank order
        #[arg(long, env = "SAKE_PEERS", value_delimiter = ',')]
        peers: Vec<SocketAddr>,

        /// Run N ranks as threads of this process
        #[arg(long)]
        local_workers: Option<usize>,

        #[arg(long, default_value = "120")]
        connect_timeout_secs: u64,

        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Print dataset statistics and batches per epoch
    Stats {
        #[arg(long)]
        data: PathBuf,

        #[arg(long, default_value = "128")]
        batch_size: usize,

        #[arg(long, default_value = "1")]
        n_devices: usize,
    },

    /// Write a synthetic dataset archive
    Synth {
        #[arg(long)]
        output: PathBuf,

        /// Comma-separated atom counts
        #[arg(long, default_value = "3,4,5,6,8")]
        lengths: String,

        #[arg(long, default_value = "256")]
        per_length: usize,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn run_rank(
    config: TrainConfig,
    device: candle_core::Device,
    comm: Box<dyn Communicator>,
    dataset: MoleculeDataset,
    checkpoint_dir: &Path,
    resume: bool,
) -> TrainResult<Vec<Option<f64>>> {
    let world_size = comm.world_size();
    let collater = Collater::new(dataset, config.batch_size, world_size)?;
    let epochs = config.epochs;

    let mut trainer = if resume {
        Trainer::resume_or_new(config, device, comm, checkpoint_dir)?
    } else {
        Trainer::new(config, device, comm)?
    };
    tracing::info!(
        rank = trainer.rank(),
        batches_per_epoch = collater.len(),
        start_epoch = trainer.epoch,
        epochs = epochs,
        "Starting training"
    );
    trainer.train_loop(&collater, epochs, Some(checkpoint_dir))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Commands::Train {
            config,
            data,
            synthetic,
            epochs,
            batch_size,
            lr,
            seed,
            checkpoint_dir,
            no_resume,
            rank,
            world_size,
            peers,
            local_workers,
            connect_timeout_secs,
            device,
        } => {
            let device = match resolve_device(&device) {
                Ok(device) => device,
                Err(message) => {
                    tracing::error!("{}", message);
                    std::process::exit(1);
                }
            };

            let mut cfg = load_train_config(&config)?;
            if let Some(e) = epochs {
                cfg.epochs = e;
            }
            if let Some(bs) = batch_size {
                cfg.batch_size = bs;
            }
            if let Some(lr) = lr {
                cfg.lr = lr;
            }
            if let Some(seed) = seed {
                cfg.seed = seed;
            }
            if let Err(errors) = cfg.validate() {
                for e in &errors {
                    tracing::error!("config: {}", e);
                }
                std::process::exit(1);
            }

            let dataset = match (data, synthetic) {
                (Some(path), false) => MoleculeDataset::load_npz(&path)
                    .with_context(|| format!("loading dataset {}", path.display()))?,
                (None, true) => MoleculeDataset::synthetic(&[3, 4, 5, 6, 8], 256, cfg.seed)?,
                _ => {
                    tracing::error!("Pass exactly one of --data or --synthetic");
                    std::process::exit(1);
                }
            };
            tracing::info!(
                molecules = dataset.len(),
                groups = dataset.n_groups(),
                "Dataset loaded"
            );

            let resume = !no_resume;
            if let Some(n) = local_workers {
                let handles: Vec<_> = LocalGroup::new(n)
                    .into_iter()
                    .map(|group| {
                        let (cfg, device, dataset, dir) =
                            (cfg.clone(), device.clone(), dataset.clone(), checkpoint_dir.clone());
                        thread::spawn(move || run_rank(cfg, device, Box::new(group), dataset, &dir, resume))
                    })
                    .collect();

                let mut first_err = None;
                for h in handles {
                    match h.join() {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            first_err.get_or_insert(e);
                        }
                        Err(_) => {
                            first_err.get_or_insert(config_error("worker thread panicked"));
                        }
                    }
                }
                if let Some(e) = first_err {
                    return Err(e.into());
                }
            } else {
                let comm: Box<dyn Communicator> = if world_size == 1 {
                    Box::new(SingleProcess)
                } else {
                    if peers.len() != world_size {
                        tracing::error!(
                            "--peers lists {} addresses but --world-size is {}",
                            peers.len(),
                            world_size
                        );
                        std::process::exit(1);
                    }
                    Box::new(
                        TcpRing::connect(rank, &peers, Duration::from_secs(connect_timeout_secs))
                            .with_context(|| format!("rank {} joining ring", rank))?,
                    )
                };
                let losses = run_rank(cfg, device, comm, dataset, &checkpoint_dir, resume)?;
                if rank == 0 {
                    match losses.last() {
                        Some(Some(last)) => println!("Final epoch loss: {:.6}", last),
                        Some(None) => println!("Final epoch had no full batch"),
                        None => {}
                    }
                }
            }
        }

        Commands::Stats {
            data,
            batch_size,
            n_devices,
        } => {
            let dataset = MoleculeDataset::load_npz(&data)?;
            let collater = Collater::new(dataset, batch_size, n_devices)?;
            let (mean, std) = collater.get_statistics()?;

            println!("Molecules: {}", collater.dataset().len());
            println!("Target mean: {:.6}", mean);
            println!("Target std:  {:.6}", std);
            println!("Batches per epoch ({} x {}): {}", n_devices, batch_size, collater.len());
            println!("{:>8} {:>10} {:>10}", "atoms", "molecules", "batches");
            for (length, group) in collater.dataset().groups() {
                println!(
                    "{:>8} {:>10} {:>10}",
                    length,
                    group.len(),
                    group.len() / collater.global_batch_size()
                );
            }
        }

        Commands::Synth {
            output,
            lengths,
            per_length,
            seed,
        } => {
            let lengths = parse_lengths(&lengths).map_err(config_error)?;
            let dataset = MoleculeDataset::synthetic(&lengths, per_length, seed)?;
            dataset.save_npz(&output)?;
            tracing::info!(
                path = %output.display(),
                molecules = dataset.len(),
                "Synthetic dataset written"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_train_config_aliases() {
        for alias in ["ani", "dense-sake", "dense_sake", "tiny-cpu", "tiny_cpu"] {
            assert!(resolve_train_config(alias).is_some(), "alias {} should resolve", alias);
        }
        assert!(resolve_train_config("unknown").is_none());
        assert!(load_train_config("unknown").is_err());
    }

    #[test]
    fn test_resolve_device_cpu() {
        assert!(matches!(resolve_device("cpu"), Ok(candle_core::Device::Cpu)));
        assert!(resolve_device("tpu").is_err());
    }

    #[test]
    fn test_parse_lengths() {
        assert_eq!(parse_lengths("3, 4,12").unwrap(), vec![3, 4, 12]);
        assert!(parse_lengths("3,x").is_err());
    }

    #[test]
    fn test_train_args_parse_peers() {
        let cli = Cli::try_parse_from([
            "sake-train",
            "train",
            "--synthetic",
            "--rank",
            "1",
            "--world-size",
            "2",
            "--peers",
            "127.0.0.1:29500,127.0.0.1:29501",
        ])
        .unwrap();
        match cli.command {
            Commands::Train {
                rank,
                world_size,
                peers,
                synthetic,
                ..
            } => {
                assert_eq!(rank, 1);
                assert_eq!(world_size, 2);
                assert_eq!(peers.len(), 2);
                assert_eq!(peers[1].port(), 29501);
                assert!(synthetic);
            }
            _ => panic!("expected train"),
        }
    }
}
