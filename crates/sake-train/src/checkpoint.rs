//! Training checkpoint save/load.
//!
//! Layout under a checkpoint root:
//!
//! ```text
//! <root>/checkpoint_<step>/model.safetensors
//! <root>/checkpoint_<step>/meta.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrainConfig;
use crate::error::{checkpoint_error, IoResultExt, TrainResult};
use crate::model::DenseSakeModel;

const PREFIX: &str = "checkpoint_";
const WEIGHTS: &str = "model.safetensors";
const META: &str = "meta.json";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: TrainConfig,
    /// Epochs completed.
    pub epoch: usize,
    /// Optimizer steps completed.
    pub step: usize,
    /// Mean loss of the last epoch; `None` when it ran no full batch.
    #[serde(default, with = "json_float::option")]
    pub loss: Option<f64>,
    /// Target statistics the model was trained against.
    #[serde(with = "json_float")]
    pub mean: f64,
    #[serde(with = "json_float")]
    pub std: f64,
}

/// JSON has no NaN or infinity, and `serde_json` writes them as `null`.
/// Non-finite values are stored as the strings `"NaN"`, `"inf"` and `"-inf"`.
mod json_float {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    fn to_repr(v: f64) -> Repr {
        if v.is_finite() {
            Repr::Number(v)
        } else {
            Repr::Text(v.to_string())
        }
    }

    fn from_repr<E: serde::de::Error>(repr: Repr) -> Result<f64, E> {
        match repr {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("expected a number, got '{}'", other))),
            },
        }
    }

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        to_repr(*v).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        from_repr(Repr::deserialize(d)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(v: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
            v.map(to_repr).serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
            Option::<Repr>::deserialize(d)?
                .map(from_repr::<D::Error>)
                .transpose()
        }
    }
}

/// `<root>/checkpoint_<step>`
pub fn checkpoint_path(root: &Path, step: usize) -> PathBuf {
    root.join(format!("{}{}", PREFIX, step))
}

/// Save weights and metadata into `dir`, creating it if needed.
pub fn save_checkpoint(varmap: &VarMap, meta: &CheckpointMeta, dir: &Path) -> TrainResult<()> {
    fs::create_dir_all(dir).with_path(dir)?;

    let weights = dir.join(WEIGHTS);
    varmap
        .save(&weights)
        .map_err(|e| checkpoint_error(format!("saving weights: {}", e), &weights))?;

    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| checkpoint_error(format!("encoding metadata: {}", e), dir))?;
    fs::write(dir.join(META), json).with_path(dir.join(META))?;
    Ok(())
}

/// Read `meta.json` from a checkpoint directory.
pub fn load_meta(dir: &Path) -> TrainResult<CheckpointMeta> {
    let path = dir.join(META);
    let raw = fs::read_to_string(&path).with_path(&path)?;
    serde_json::from_str(&raw).map_err(|e| checkpoint_error(format!("decoding metadata: {}", e), &path))
}

/// Overwrite the variables in `varmap` with the stored weights.
pub fn restore_weights(varmap: &mut VarMap, dir: &Path) -> TrainResult<()> {
    let weights = dir.join(WEIGHTS);
    varmap
        .load(&weights)
        .map_err(|e| checkpoint_error(format!("loading weights: {}", e), &weights))
}

/// Rebuild a model from a checkpoint directory.
pub fn load_checkpoint(
    dir: &Path,
    device: &Device,
) -> TrainResult<(DenseSakeModel, VarMap, CheckpointMeta)> {
    let meta = load_meta(dir)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = DenseSakeModel::new(&meta.config.model, vb)?;
    restore_weights(&mut varmap, dir)?;
    Ok((model, varmap, meta))
}

/// Checkpoint directories under `root`, oldest first.
pub fn list_checkpoints(root: &Path) -> TrainResult<Vec<(PathBuf, usize)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(root).with_path(root)? {
        let path = entry.with_path(root)?.path();
        if !path.is_dir() {
            continue;
        }
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(PREFIX))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(step) = step {
            checkpoints.push((path, step));
        }
    }
    checkpoints.sort_by_key(|(_, step)| *step);
    Ok(checkpoints)
}

/// Directory of the highest-step checkpoint, if any.
pub fn latest_checkpoint(root: &Path) -> TrainResult<Option<PathBuf>> {
    Ok(list_checkpoints(root)?.pop().map(|(path, _)| path))
}

/// Remove all but the newest `keep_last` checkpoints. Returns how many were removed.
pub fn cleanup_old_checkpoints(root: &Path, keep_last: usize) -> TrainResult<usize> {
    let checkpoints = list_checkpoints(root)?;
    let to_remove = checkpoints.len().saturating_sub(keep_last);

    for (path, step) in checkpoints.iter().take(to_remove) {
        fs::remove_dir_all(path).with_path(path)?;
        debug!(step = step, path = %path.display(), "Removed old checkpoint");
    }
    Ok(to_remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainError;

    fn build(cfg: &TrainConfig) -> TrainResult<(DenseSakeModel, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DenseSakeModel::new(&cfg.model, vb)?;
        Ok((model, varmap))
    }

    fn meta(cfg: &TrainConfig, step: usize) -> CheckpointMeta {
        CheckpointMeta {
            config: cfg.clone(),
            epoch: 2,
            step,
            loss: Some(0.125),
            mean: -200.5,
            std: 3.25,
        }
    }

    #[test]
    fn test_checkpoint_save_load_roundtrip() -> TrainResult<()> {
        let cfg = TrainConfig::tiny_cpu();
        let (model, varmap) = build(&cfg)?;
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 42);

        save_checkpoint(&varmap, &meta(&cfg, 42), &path)?;
        assert!(path.join("model.safetensors").exists());
        assert!(path.join("meta.json").exists());

        let (loaded, _varmap, loaded_meta) = load_checkpoint(&path, &Device::Cpu)?;
        assert_eq!(loaded_meta, meta(&cfg, 42));

        let species = candle_core::Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu)?;
        let coords = candle_core::Tensor::new(&[[[0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.5, 0.0]]], &Device::Cpu)?;
        let a = model.predict(&species, &coords, 0.0, 1.0)?.to_vec2::<f32>()?;
        let b = loaded.predict(&species, &coords, 0.0, 1.0)?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_latest_and_cleanup() -> TrainResult<()> {
        let cfg = TrainConfig::tiny_cpu();
        let (_model, varmap) = build(&cfg)?;
        let dir = tempfile::tempdir().unwrap();

        for step in [5, 100, 20] {
            save_checkpoint(&varmap, &meta(&cfg, step), &checkpoint_path(dir.path(), step))?;
        }
        // unrelated entries are ignored
        fs::create_dir_all(dir.path().join("checkpoint_final")).unwrap();
        fs::write(dir.path().join("checkpoint_7"), b"not a dir").unwrap();

        let steps: Vec<usize> = list_checkpoints(dir.path())?.into_iter().map(|(_, s)| s).collect();
        assert_eq!(steps, vec![5, 20, 100]);
        assert_eq!(latest_checkpoint(dir.path())?, Some(checkpoint_path(dir.path(), 100)));

        assert_eq!(cleanup_old_checkpoints(dir.path(), 1)?, 2);
        assert!(!checkpoint_path(dir.path(), 5).exists());
        assert!(!checkpoint_path(dir.path(), 20).exists());
        assert!(checkpoint_path(dir.path(), 100).exists());
        assert_eq!(cleanup_old_checkpoints(dir.path(), 1)?, 0);
        Ok(())
    }

    #[test]
    fn test_missing_root_has_no_checkpoints() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nope");
        assert!(latest_checkpoint(&root)?.is_none());
        assert_eq!(cleanup_old_checkpoints(&root, 1)?, 0);
        Ok(())
    }

    #[test]
    fn test_restore_overwrites_weights() -> TrainResult<()> {
        let cfg = TrainConfig::tiny_cpu();
        let (_a, saved) = build(&cfg)?;
        let (_b, mut fresh) = build(&cfg)?;
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&saved, &meta(&cfg, 1), dir.path())?;

        restore_weights(&mut fresh, dir.path())?;
        let x = crate::distributed::sorted_vars(&saved)?;
        let y = crate::distributed::sorted_vars(&fresh)?;
        for ((na, va), (nb, vb)) in x.iter().zip(&y) {
            assert_eq!(na, nb);
            assert_eq!(
                va.flatten_all()?.to_vec1::<f32>()?,
                vb.flatten_all()?.to_vec1::<f32>()?
            );
        }
        Ok(())
    }

    #[test]
    fn test_non_finite_meta_roundtrip() -> TrainResult<()> {
        let cfg = TrainConfig::tiny_cpu();
        let (_model, varmap) = build(&cfg)?;
        let dir = tempfile::tempdir().unwrap();

        let mut m = meta(&cfg, 3);
        m.loss = Some(f64::NAN);
        m.mean = f64::NEG_INFINITY;
        m.std = f64::INFINITY;
        save_checkpoint(&varmap, &m, dir.path())?;

        let loaded = load_meta(dir.path())?;
        assert!(loaded.loss.is_some_and(f64::is_nan));
        assert_eq!(loaded.mean, f64::NEG_INFINITY);
        assert_eq!(loaded.std, f64::INFINITY);

        m.loss = None;
        save_checkpoint(&varmap, &m, dir.path())?;
        assert_eq!(load_meta(dir.path())?.loss, None);
        Ok(())
    }

    #[test]
    fn test_meta_rejects_unknown_float_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut json = serde_json::to_value(meta(&TrainConfig::tiny_cpu(), 1)).unwrap();
        json["mean"] = serde_json::Value::String("lots".to_string());
        fs::write(dir.path().join("meta.json"), json.to_string()).unwrap();
        assert!(matches!(load_meta(dir.path()), Err(TrainError::Checkpoint { .. })));
    }

    #[test]
    fn test_missing_meta_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_meta(dir.path()).unwrap_err();
        assert!(matches!(err, TrainError::Io { .. }));
        assert!(err.path().unwrap().ends_with("meta.json"));
    }
}
