//! Dataset preparation: tagged raw text in, validated JSONL splits out.

pub mod convert;
pub mod example;
pub mod jsonl;
pub mod prepare;
pub mod preprocess;
pub mod split;
pub mod validate;

pub use convert::FormatConverter;
pub use example::{ChatMessage, Example, Record, Role};
pub use prepare::{PrepareReport, WrittenSplit, prepare};
pub use preprocess::{PreprocessOutput, PreprocessStats, Preprocessor};
pub use split::{DatasetSplits, DatasetSplitter};
pub use validate::{DatasetValidator, FileReport, SplitsReport};
