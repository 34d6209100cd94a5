//! Fine-tuning through `mlx_lm.lora`.
//!
//! The trainer supervises the framework subprocess, turns its report lines
//! into [`events::TrainerEvent`]s and fans them out to callbacks.

pub mod callbacks;
pub mod checkpoint;
pub mod events;
pub mod metrics;
pub mod trainer;

pub use callbacks::{CallbackAction, Logs, TrainingCallback};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use events::TrainerEvent;
pub use metrics::TrainingMetrics;
pub use trainer::{HirnuTrainer, TrainingOutcome, TrainingPlan, TrainingStatus};
