//! The full preparation run: preprocess, split, write and validate.

use crate::data::convert::FormatConverter;
use crate::data::preprocess::{PreprocessStats, Preprocessor};
use crate::data::split::{DatasetSplitter, check_splits};
use crate::data::validate::{DatasetValidator, SplitsReport};
use crate::error::MlError;
use hirnu_core::DataConfig;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Where each split landed and how many examples it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenSplit {
    pub path: PathBuf,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub stats: PreprocessStats,
    pub total_examples: usize,
    pub train: WrittenSplit,
    pub test: WrittenSplit,
    pub valid: WrittenSplit,
    /// `None` when validation was skipped.
    pub validation: Option<SplitsReport>,
}

impl PrepareReport {
    pub fn is_valid(&self) -> bool {
        self.validation.as_ref().is_none_or(|v| v.all_valid)
    }
}

/// Run every preparation stage against `config`. Nothing is written when
/// the split check fails.
pub fn prepare(config: &DataConfig, skip_validation: bool) -> Result<PrepareReport, MlError> {
    let splitter = DatasetSplitter::new(config.splits.clone())?;
    let preprocessor = Preprocessor::from_config(config);

    let output = preprocessor.process_sources(&config.data.sources);
    info!(
        files = output.stats.files_read,
        skipped_files = output.stats.files_skipped,
        pairs = output.stats.pairs_parsed,
        malformed = output.stats.malformed,
        filtered = output.stats.length_filtered,
        examples = output.examples.len(),
        "Preprocessing complete"
    );
    if output.examples.is_empty() {
        return Err(MlError::dataset(format!(
            "no examples found under {}, {} or {}",
            config.data.sources.grammar.display(),
            config.data.sources.vocabulary.display(),
            config.data.sources.texts.display()
        )));
    }

    let total_examples = output.examples.len();
    let splits = splitter.split(output.examples);
    let check = check_splits(&splits);
    if !check.passed {
        return Err(MlError::dataset(format!(
            "split check failed: {}",
            check.warnings.join("; ")
        )));
    }

    std::fs::create_dir_all(&config.data.processed_data_dir)?;
    let converter = FormatConverter::new(config.format.kind);
    let (train_path, test_path, valid_path) = config.split_paths();
    let train = WrittenSplit {
        count: converter.write_jsonl(&splits.train, &train_path)?,
        path: train_path,
    };
    let test = WrittenSplit {
        count: converter.write_jsonl(&splits.test, &test_path)?,
        path: test_path,
    };
    let valid = WrittenSplit {
        count: converter.write_jsonl(&splits.valid, &valid_path)?,
        path: valid_path,
    };

    let validation = (!skip_validation).then(|| {
        DatasetValidator::new(config.format.kind).validate_splits(
            &train.path,
            &test.path,
            &valid.path,
        )
    });

    Ok(PrepareReport {
        stats: output.stats,
        total_examples,
        train,
        test,
        valid,
        validation,
    })
}
