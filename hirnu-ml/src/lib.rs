//! # hirnu-ml: data preparation, training orchestration and evaluation
//!
//! The model-side work (loading, LoRA injection, generation, fusion) belongs to
//! the MLX-LM Python framework; this crate prepares its inputs, drives it as a
//! subprocess through [`PythonRuntime`], and interprets its output.
//!
//! Pipeline:
//! 1. [`data::preprocess`] parses tagged raw text into chat [`data::Example`]s
//! 2. [`data::split`] shuffles with a fixed seed and cuts train/test/valid
//! 3. [`data::convert`] writes the configured record format as JSONL
//! 4. [`data::validate`] schema-checks the written files
//! 5. [`training`] runs `mlx_lm.lora` with callbacks and checkpoint tracking
//! 6. [`eval`] and [`inference`] score and query the tuned model

pub mod data;
pub mod error;
pub mod eval;
pub mod inference;
pub mod model;
pub mod runtime;
pub mod training;

pub use data::{Example, Record};
pub use error::MlError;
pub use runtime::PythonRuntime;
