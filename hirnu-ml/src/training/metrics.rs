//! Training metrics tracking.

use serde::{Deserialize, Serialize};

/// A loss value at a given iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossPoint {
    pub iteration: usize,
    pub loss: f64,
}

/// Everything observed over one training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub iterations_completed: usize,
    pub epochs_completed: usize,
    pub train_loss: Vec<LossPoint>,
    pub val_loss: Vec<LossPoint>,
    /// Per-epoch mean of the reported training losses.
    pub epoch_loss: Vec<f64>,
    pub best_val_loss: Option<f64>,
    pub best_iteration: Option<usize>,
    pub peak_memory_gb: Option<f64>,
    pub test_loss: Option<f64>,
    pub test_perplexity: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_train(&mut self, iteration: usize, loss: f64, peak_memory_gb: Option<f64>) {
        self.train_loss.push(LossPoint { iteration, loss });
        self.iterations_completed = self.iterations_completed.max(iteration);
        if let Some(mem) = peak_memory_gb {
            self.peak_memory_gb = Some(self.peak_memory_gb.map_or(mem, |m| m.max(mem)));
        }
    }

    pub fn record_val(&mut self, iteration: usize, loss: f64) {
        self.val_loss.push(LossPoint { iteration, loss });
        if loss.is_finite() && self.best_val_loss.is_none_or(|best| loss < best) {
            self.best_val_loss = Some(loss);
            self.best_iteration = Some(iteration);
        }
    }

    pub fn record_epoch(&mut self, mean_train_loss: Option<f64>) {
        self.epochs_completed += 1;
        if let Some(loss) = mean_train_loss {
            self.epoch_loss.push(loss);
        }
    }

    pub fn last_train_loss(&self) -> Option<f64> {
        self.train_loss.last().map(|p| p.loss)
    }

    pub fn last_val_loss(&self) -> Option<f64> {
        self.val_loss.last().map(|p| p.loss)
    }
}
