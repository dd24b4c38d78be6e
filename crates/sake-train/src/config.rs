//! Training configuration for dense SAKE models.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{config_error, IoResultExt, TrainResult};

fn default_n_species() -> usize {
    4 // H, C, N, O
}

fn default_n_rbf() -> usize {
    50
}

fn default_cutoff() -> f64 {
    5.0 // Angstrom
}

fn default_n_coefficients() -> usize {
    16
}

fn default_adam_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_keep_checkpoints() -> usize {
    1
}

fn default_log_interval() -> usize {
    100
}

/// Dense SAKE architecture hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_features: usize,
    pub out_features: usize,
    /// Number of message-passing layers.
    pub depth: usize,
    /// Width of the one-hot species encoding.
    #[serde(default = "default_n_species")]
    pub n_species: usize,
    /// Radial basis functions used to expand pairwise distances.
    #[serde(default = "default_n_rbf")]
    pub n_rbf: usize,
    /// Upper end of the RBF centre grid.
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,
    /// Channels of the spatial attention (equivariant) features.
    #[serde(default = "default_n_coefficients")]
    pub n_coefficients: usize,
}

impl ModelConfig {
    /// hidden_features=64, out_features=1, depth=6
    pub fn dense_sake() -> Self {
        Self {
            hidden_features: 64,
            out_features: 1,
            depth: 6,
            n_species: default_n_species(),
            n_rbf: default_n_rbf(),
            cutoff: default_cutoff(),
            n_coefficients: default_n_coefficients(),
        }
    }
}

/// Model + training hyperparameter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model: ModelConfig,

    /// Records per device per step. A global batch is `batch_size * world_size`.
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    #[serde(default = "default_adam_betas")]
    pub adam_betas: (f64, f64),
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f64,
    /// Additive weight decay applied to gradients before clipping.
    pub weight_decay: f64,
    /// Element-wise gradient clip value.
    pub grad_clip: f64,
    /// Shared by all ranks; batch order for epoch `e` is drawn from `seed + e`.
    pub seed: u64,
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Abort with an error instead of logging when the loss goes non-finite.
    #[serde(default)]
    pub stop_on_divergence: bool,
}

impl TrainConfig {
    /// Validate configuration and return list of errors (if any).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.model.hidden_features == 0 {
            errors.push("hidden_features must be greater than 0".to_string());
        }

        if self.model.out_features == 0 {
            errors.push("out_features must be greater than 0".to_string());
        }

        if self.model.depth == 0 {
            errors.push("depth must be greater than 0".to_string());
        }

        if self.model.n_species == 0 {
            errors.push("n_species must be greater than 0".to_string());
        }

        if self.model.n_coefficients == 0 {
            errors.push("n_coefficients must be greater than 0".to_string());
        }

        if self.model.n_rbf < 2 {
            errors.push(format!("n_rbf ({}) must be at least 2", self.model.n_rbf));
        }

        if self.model.cutoff <= 0.0 {
            errors.push(format!("cutoff ({}) must be positive", self.model.cutoff));
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if self.lr <= 0.0 {
            errors.push(format!("learning rate ({}) must be positive", self.lr));
        }

        if self.weight_decay < 0.0 {
            errors.push(format!("weight_decay ({}) must be non-negative", self.weight_decay));
        }

        if self.grad_clip <= 0.0 {
            errors.push(format!("grad_clip ({}) must be positive", self.grad_clip));
        }

        if self.keep_checkpoints == 0 {
            errors.push("keep_checkpoints must be at least 1".to_string());
        }

        if self.log_interval == 0 {
            errors.push("log_interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Like [`validate`](Self::validate) but folded into a single error.
    pub fn check(&self) -> TrainResult<()> {
        self.validate().map_err(|errors| config_error(errors.join("; ")))
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| config_error(format!("{}: {}", path.display(), e)))
    }

    /// Estimated number of trainable parameters.
    pub fn param_count_estimate(&self) -> usize {
        let m = &self.model;
        let h = m.hidden_features;
        let c = m.n_coefficients;
        let linear = |i: usize, o: usize| i * o + o;

        let embed = linear(m.n_species, h);
        let layer = linear(2 * h + m.n_rbf, h)
            + linear(h, h)
            + linear(h, 1)
            + linear(h, c)
            + linear(2 * h + c, h)
            + linear(h, h);
        let head = linear(h, h) + linear(h, m.out_features);
        embed + m.depth * layer + head
    }

    /// ANI production run: batch 128 per device, Adam 1e-5, 1000 epochs.
    pub fn ani() -> Self {
        Self {
            model: ModelConfig::dense_sake(),
            batch_size: 128,
            epochs: 1000,
            lr: 1e-5,
            adam_betas: default_adam_betas(),
            adam_eps: default_adam_eps(),
            weight_decay: 1e-8,
            grad_clip: 1.0,
            seed: 2666,
            keep_checkpoints: default_keep_checkpoints(),
            log_interval: default_log_interval(),
            stop_on_divergence: false,
        }
    }

    /// Small model for CPU smoke runs and tests.
    pub fn tiny_cpu() -> Self {
        Self {
            model: ModelConfig {
                hidden_features: 16,
                out_features: 1,
                depth: 2,
                n_species: 4,
                n_rbf: 8,
                cutoff: 5.0,
                n_coefficients: 4,
            },
            batch_size: 4,
            epochs: 3,
            lr: 1e-3,
            adam_betas: default_adam_betas(),
            adam_eps: default_adam_eps(),
            weight_decay: 1e-8,
            grad_clip: 1.0,
            seed: 42,
            keep_checkpoints: default_keep_checkpoints(),
            log_interval: 10,
            stop_on_divergence: false,
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::ani()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(TrainConfig::ani().validate().is_ok());
        assert!(TrainConfig::tiny_cpu().validate().is_ok());
    }

    #[test]
    fn test_ani_matches_production_hyperparameters() {
        let cfg = TrainConfig::ani();
        assert_eq!(cfg.batch_size, 128);
        assert_eq!(cfg.model.hidden_features, 64);
        assert_eq!(cfg.model.out_features, 1);
        assert_eq!(cfg.model.depth, 6);
        assert_eq!(cfg.epochs, 1000);
        assert!((cfg.lr - 1e-5).abs() < 1e-12);
        assert!((cfg.weight_decay - 1e-8).abs() < 1e-15);
        assert!((cfg.grad_clip - 1.0).abs() < 1e-12);
        assert_eq!(cfg.keep_checkpoints, 1);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.batch_size = 0;
        cfg.lr = 0.0;
        cfg.model.depth = 0;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "errors: {:?}", errors);
        assert!(errors.iter().any(|e| e.contains("batch_size")));
        assert!(errors.iter().any(|e| e.contains("learning rate")));
        assert!(errors.iter().any(|e| e.contains("depth")));
        assert!(cfg.check().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_widths_and_retention() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.model.n_coefficients = 0;
        cfg.keep_checkpoints = 0;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2, "errors: {:?}", errors);
        assert!(errors.iter().any(|e| e.contains("n_coefficients")));
        assert!(errors.iter().any(|e| e.contains("keep_checkpoints")));
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let json = r#"{
            "model": { "hidden_features": 8, "out_features": 1, "depth": 1 },
            "batch_size": 2,
            "epochs": 1,
            "lr": 0.01,
            "weight_decay": 0.0,
            "grad_clip": 1.0,
            "seed": 7
        }"#;
        let cfg: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.model.n_species, 4);
        assert_eq!(cfg.model.n_rbf, 50);
        assert_eq!(cfg.keep_checkpoints, 1);
        assert_eq!(cfg.adam_betas, (0.9, 0.999));
        assert!(!cfg.stop_on_divergence);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
        let loaded = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_param_count_grows_with_depth() {
        let mut cfg = TrainConfig::tiny_cpu();
        let shallow = cfg.param_count_estimate();
        cfg.model.depth += 1;
        assert!(cfg.param_count_estimate() > shallow);
    }
}
