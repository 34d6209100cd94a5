//! Training callbacks: metrics logging, checkpointing, early stopping and
//! divergence detection.

use crate::training::checkpoint::CheckpointManager;
use chrono::{DateTime, Utc};
use hirnu_core::config::{EarlyStoppingConfig, MonitorMode};
use hirnu_core::persistence;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Named numeric values handed to callbacks.
pub type Logs = BTreeMap<String, f64>;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hooks invoked by the trainer. Every hook defaults to a no-op.
///
/// Epochs are derived from the iteration count; batch hooks fire once per
/// training report line, so `iteration` advances by `logging.log_steps`.
pub trait TrainingCallback: Send + Sync {
    fn name(&self) -> &str;

    fn on_train_begin(&mut self, _logs: &Logs) {}

    fn on_train_end(&mut self, _logs: &Logs) {}

    fn on_epoch_begin(&mut self, _epoch: usize, _logs: &Logs) {}

    fn on_epoch_end(&mut self, _epoch: usize, _logs: &Logs) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_batch_end(&mut self, _iteration: usize, _logs: &Logs) -> CallbackAction {
        CallbackAction::Continue
    }

    /// The framework wrote an adapter snapshot at `iteration`.
    fn on_checkpoint(&mut self, _iteration: usize, _adapter: &Path, _logs: &Logs) {}
}

// ---------------------------------------------------------------------------
// Metrics logger
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MetricsEvent<'a> {
    timestamp: DateTime<Utc>,
    event: &'a str,
    data: &'a Logs,
}

/// Appends `{timestamp, event, data}` lines to `metrics.jsonl`.
#[derive(Debug)]
pub struct MetricsLogger {
    path: PathBuf,
    started: Option<DateTime<Utc>>,
}

impl MetricsLogger {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join("metrics.jsonl"),
            started: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn log(&self, event: &str, data: &Logs) {
        let record = MetricsEvent {
            timestamp: Utc::now(),
            event,
            data,
        };
        if let Err(e) = persistence::append_jsonl(&self.path, &record) {
            warn!(path = %self.path.display(), error = %e, "Failed to write metrics event");
        }
    }

    fn with(logs: &Logs, key: &str, value: f64) -> Logs {
        let mut data = logs.clone();
        data.insert(key.to_string(), value);
        data
    }
}

impl TrainingCallback for MetricsLogger {
    fn name(&self) -> &str {
        "metrics_logger"
    }

    fn on_train_begin(&mut self, logs: &Logs) {
        self.started = Some(Utc::now());
        self.log("train_begin", logs);
    }

    fn on_train_end(&mut self, logs: &Logs) {
        let data = match self.started {
            Some(start) => {
                let secs = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
                Self::with(logs, "training_duration_seconds", secs)
            }
            None => logs.clone(),
        };
        self.log("train_end", &data);
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> CallbackAction {
        self.log("epoch_end", &Self::with(logs, "epoch", epoch as f64));
        CallbackAction::Continue
    }

    fn on_batch_end(&mut self, iteration: usize, logs: &Logs) -> CallbackAction {
        self.log("batch_end", &Self::with(logs, "batch", iteration as f64));
        CallbackAction::Continue
    }

    fn on_checkpoint(&mut self, iteration: usize, _adapter: &Path, logs: &Logs) {
        self.log("checkpoint", &Self::with(logs, "iteration", iteration as f64));
    }
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

/// Records each adapter snapshot through a [`CheckpointManager`].
#[derive(Debug)]
pub struct CheckpointCallback {
    manager: CheckpointManager,
}

impl CheckpointCallback {
    pub fn new(manager: CheckpointManager) -> Self {
        Self { manager }
    }
}

impl TrainingCallback for CheckpointCallback {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn on_checkpoint(&mut self, iteration: usize, adapter: &Path, logs: &Logs) {
        let loss = logs
            .get("val_loss")
            .or_else(|| logs.get("train_loss"))
            .copied();
        if let Err(e) = self.manager.save(iteration, loss, adapter) {
            warn!(iteration, error = %e, "Failed to record checkpoint");
        }
    }
}

// ---------------------------------------------------------------------------
// Early stopping
// ---------------------------------------------------------------------------

/// Stops when the monitored metric has not improved by `min_delta` for
/// `patience` consecutive epochs. Epochs whose logs lack the metric are
/// ignored.
#[derive(Debug, Clone)]
pub struct EarlyStoppingCallback {
    pub patience: usize,
    pub min_delta: f64,
    pub metric: String,
    pub mode: MonitorMode,
    wait: usize,
    best: Option<f64>,
    stopped_epoch: Option<usize>,
}

impl EarlyStoppingCallback {
    pub fn new(patience: usize, min_delta: f64, metric: impl Into<String>, mode: MonitorMode) -> Self {
        Self {
            patience,
            min_delta,
            metric: metric.into(),
            mode,
            wait: 0,
            best: None,
            stopped_epoch: None,
        }
    }

    pub fn from_config(config: &EarlyStoppingConfig) -> Self {
        Self::new(
            config.patience,
            config.min_delta,
            config.metric.clone(),
            config.mode,
        )
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    fn is_improvement(&self, value: f64) -> bool {
        match (self.best, self.mode) {
            (None, _) => !value.is_nan(),
            (Some(best), MonitorMode::Min) => value < best - self.min_delta,
            (Some(best), MonitorMode::Max) => value > best + self.min_delta,
        }
    }

    /// Feed one epoch's value of the monitored metric.
    pub fn observe(&mut self, epoch: usize, value: f64) -> CallbackAction {
        if self.is_improvement(value) {
            self.best = Some(value);
            self.wait = 0;
            return CallbackAction::Continue;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped_epoch = Some(epoch);
            info!(
                epoch,
                metric = %self.metric,
                best = ?self.best,
                "Early stopping triggered"
            );
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}

impl TrainingCallback for EarlyStoppingCallback {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Logs) -> CallbackAction {
        match logs.get(&self.metric) {
            Some(&value) => self.observe(epoch, value),
            None => CallbackAction::Continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Divergence guard
// ---------------------------------------------------------------------------

/// Stops on a non-finite training loss.
#[derive(Debug, Clone, Default)]
pub struct DivergenceGuard {
    tripped_at: Option<usize>,
}

impl DivergenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tripped_at(&self) -> Option<usize> {
        self.tripped_at
    }
}

impl TrainingCallback for DivergenceGuard {
    fn name(&self) -> &str {
        "divergence_guard"
    }

    fn on_batch_end(&mut self, iteration: usize, logs: &Logs) -> CallbackAction {
        match logs.get("train_loss") {
            Some(loss) if !loss.is_finite() => {
                warn!(iteration, loss, "Training loss diverged");
                self.tripped_at = Some(iteration);
                CallbackAction::Stop
            }
            _ => CallbackAction::Continue,
        }
    }
}
