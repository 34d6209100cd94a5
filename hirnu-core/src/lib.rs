//! # Hirnu Core
//!
//! Shared foundation for the Hirnu fine-tuning pipeline: the YAML-backed
//! configuration model, its layered loader, and the atomic file helpers every
//! pipeline stage writes through.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    load_data_config, load_training_config, DataConfig, EarlyStoppingConfig, MonitorMode,
    RecordFormat, TrainingConfig,
};
pub use error::{ConfigError, Result};
