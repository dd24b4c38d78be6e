//! Structured logging for training with tracing.
//!
//! Every training event carries the emitting rank so interleaved output from a
//! multi-process run can be filtered per worker.

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,sake_train=info,sake_comm=info";

/// Gradient norm above which a step is flagged.
pub const GRAD_NORM_WARN: f64 = 10.0;

/// Initialize structured logging.
///
/// Reads the filter from `RUST_LOG`; `json` selects JSON lines over the
/// human-readable format. Safe to call more than once.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if result.is_ok() {
        info!(json = json, "Structured logging initialized");
    }
}

/// Per-step metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    /// Loss averaged across ranks.
    pub loss: f64,
    pub learning_rate: f64,
    /// L2 norm of the averaged gradient.
    pub grad_norm: f64,
    /// Molecules per second on this rank.
    pub samples_per_sec: f64,
}

/// Log a training step.
///
/// Emits an error for a non-finite loss and a warning for a large gradient norm.
pub fn log_training_step(rank: usize, step: usize, metrics: &StepMetrics) {
    let span = span!(Level::INFO, "training_step", rank = rank, step = step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        log_divergence(rank, step, metrics.loss);
        return;
    }

    info!(
        rank = rank,
        loss = metrics.loss,
        lr = metrics.learning_rate,
        grad_norm = metrics.grad_norm,
        samples_per_sec = metrics.samples_per_sec,
        "Training step completed"
    );

    if metrics.grad_norm > GRAD_NORM_WARN {
        warn!(
            rank = rank,
            grad_norm = metrics.grad_norm,
            step = step,
            threshold = GRAD_NORM_WARN,
            "High gradient norm detected; per-element clipping still applies"
        );
    }
}

/// Log the end of an epoch.
/// `mean_loss` is `None` when the epoch had no full batch.
pub fn log_epoch(rank: usize, epoch: usize, steps: usize, mean_loss: Option<f64>, elapsed_secs: f64) {
    info!(
        rank = rank,
        epoch = epoch,
        steps = steps,
        loss = mean_loss,
        elapsed_secs = elapsed_secs,
        event = "epoch_completed",
        "Epoch completed"
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(rank: usize, step: usize, path: &str, loss: Option<f64>) {
    info!(
        rank = rank,
        step = step,
        path = path,
        loss = loss,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log a restore from an existing checkpoint.
pub fn log_checkpoint_restore(rank: usize, step: usize, epoch: usize, path: &str) {
    info!(
        rank = rank,
        step = step,
        epoch = epoch,
        path = path,
        event = "checkpoint_restored",
        "Resumed from checkpoint"
    );
}

/// Log a NaN or infinite loss.
pub fn log_divergence(rank: usize, step: usize, loss: f64) {
    error!(
        rank = rank,
        step = step,
        loss = loss,
        event = "divergence",
        "Training diverged! NaN or infinite loss detected"
    );
}

/// Log the size of a gradient all-reduce.
pub fn log_collective(rank: usize, elements: usize, millis: f64) {
    debug!(
        rank = rank,
        elements = elements,
        millis = millis,
        "Gradient all-reduce"
    );
}
