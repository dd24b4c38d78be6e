//! Error type shared by every training module.
//!
//! Variants carry owned strings so errors can cross rank threads and be cloned
//! into logs without holding on to library error types.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    /// Tensor op, shape or device failure inside candle.
    #[error("tensor error: {0}")]
    Candle(String),

    #[error("checkpoint '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Malformed archive, bad shapes, or an unusable batch request.
    #[error("dataset error: {0}")]
    DataLoading(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A collective failed; peers may be gone.
    #[error("collective failed: {0}")]
    Comm(String),

    #[error("loss became {loss} at step {step}")]
    Divergence { loss: f64, step: usize },

    #[error("i/o on '{path}': {message}")]
    Io { message: String, path: String },
}

pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Filesystem-level failures that may succeed on retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Checkpoint { .. })
    }

    /// File or directory the error refers to, when there is one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Checkpoint { path, .. } | Self::Io { path, .. } => Some(path.as_str()),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        Self::Candle(err.to_string())
    }
}

impl From<sake_comm::CommError> for TrainError {
    fn from(err: sake_comm::CommError) -> Self {
        Self::Comm(err.to_string())
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

/// Attach the offending path to an `io::Result`.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|err| TrainError::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        })
    }
}

pub fn checkpoint_error(message: impl Into<String>, path: impl AsRef<Path>) -> TrainError {
    TrainError::Checkpoint {
        path: path.as_ref().display().to_string(),
        message: message.into(),
    }
}

pub fn data_error(message: impl Into<String>) -> TrainError {
    TrainError::DataLoading(message.into())
}

pub fn config_error(message: impl Into<String>) -> TrainError {
    TrainError::Config(message.into())
}
