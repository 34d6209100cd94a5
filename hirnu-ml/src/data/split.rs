//! Seeded train/test/valid splitting.

use crate::error::MlError;
use hirnu_core::config::SplitConfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Minimum total size for a dataset to pass [`check_splits`].
pub const MIN_TOTAL_EXAMPLES: usize = 10;

/// The three partitions of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplits<T> {
    pub train: Vec<T>,
    pub test: Vec<T>,
    pub valid: Vec<T>,
}

impl<T> DatasetSplits<T> {
    pub fn total(&self) -> usize {
        self.train.len() + self.test.len() + self.valid.len()
    }
}

/// Shuffles with a fixed seed, then cuts by ratio.
#[derive(Debug, Clone)]
pub struct DatasetSplitter {
    config: SplitConfig,
}

impl DatasetSplitter {
    /// Fails when the ratios are negative or do not sum to 1.0.
    pub fn new(config: SplitConfig) -> Result<Self, MlError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// `train_end = floor(n * train)`, `test_end = train_end + floor(n * test)`,
    /// valid takes the remainder.
    pub fn split<T>(&self, mut items: Vec<T>) -> DatasetSplits<T> {
        let mut rng = StdRng::seed_from_u64(self.config.random_seed);
        items.shuffle(&mut rng);

        let n = items.len();
        let train_end = cut(n, self.config.train).min(n);
        let test_end = (train_end + cut(n, self.config.test)).min(n);

        let valid = items.split_off(test_end);
        let test = items.split_off(train_end);
        let splits = DatasetSplits {
            train: items,
            test,
            valid,
        };

        info!(
            train = splits.train.len(),
            test = splits.test.len(),
            valid = splits.valid.len(),
            seed = self.config.random_seed,
            "Dataset splits created"
        );
        splits
    }
}

fn cut(n: usize, ratio: f64) -> usize {
    (n as f64 * ratio).floor() as usize
}

/// Result of the post-split sanity check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCheck {
    pub passed: bool,
    pub warnings: Vec<String>,
}

/// Every partition must be non-empty and the dataset must hold at least
/// [`MIN_TOTAL_EXAMPLES`] examples.
pub fn check_splits<T>(splits: &DatasetSplits<T>) -> SplitCheck {
    let mut warnings = Vec::new();
    for (name, len) in [
        ("training", splits.train.len()),
        ("test", splits.test.len()),
        ("validation", splits.valid.len()),
    ] {
        if len == 0 {
            warnings.push(format!("No {name} examples"));
        }
    }
    let total = splits.total();
    if total < MIN_TOTAL_EXAMPLES {
        warnings.push(format!("Very small dataset ({total} examples)"));
    }
    for w in &warnings {
        warn!("{w}");
    }
    SplitCheck {
        passed: warnings.is_empty(),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn splitter(train: f64, test: f64, valid: f64, seed: u64) -> DatasetSplitter {
        DatasetSplitter::new(SplitConfig {
            train,
            test,
            valid,
            random_seed: seed,
        })
        .unwrap()
    }

    #[test]
    fn test_default_sizes() {
        let splits = splitter(0.8, 0.1, 0.1, 42).split((0..100).collect::<Vec<_>>());
        assert_eq!(splits.train.len(), 80);
        assert_eq!(splits.test.len(), 10);
        assert_eq!(splits.valid.len(), 10);
    }

    #[test]
    fn test_floor_cuts_give_remainder_to_valid() {
        let splits = splitter(0.8, 0.1, 0.1, 42).split((0..7).collect::<Vec<_>>());
        assert_eq!(splits.train.len(), 5);
        assert_eq!(splits.test.len(), 0);
        assert_eq!(splits.valid.len(), 2);
    }

    #[test]
    fn test_same_seed_same_split() {
        let a = splitter(0.8, 0.1, 0.1, 7).split((0..50).collect::<Vec<_>>());
        let b = splitter(0.8, 0.1, 0.1, 7).split((0..50).collect::<Vec<_>>());
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seed_different_order() {
        let a = splitter(0.8, 0.1, 0.1, 1).split((0..50).collect::<Vec<_>>());
        let b = splitter(0.8, 0.1, 0.1, 2).split((0..50).collect::<Vec<_>>());
        assert_ne!(a.train, b.train);
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let result = DatasetSplitter::new(SplitConfig {
            train: 0.5,
            test: 0.1,
            valid: 0.1,
            random_seed: 42,
        });
        assert!(matches!(result, Err(MlError::Config(_))));
    }

    #[test]
    fn test_empty_input() {
        let splits = splitter(0.8, 0.1, 0.1, 42).split(Vec::<u32>::new());
        assert_eq!(splits.total(), 0);
    }

    #[test]
    fn test_check_splits() {
        let good = splitter(0.8, 0.1, 0.1, 42).split((0..20).collect::<Vec<_>>());
        assert!(check_splits(&good).passed);

        let small = splitter(0.8, 0.1, 0.1, 42).split((0..5).collect::<Vec<_>>());
        let check = check_splits(&small);
        assert!(!check.passed);
        assert!(check.warnings.iter().any(|w| w.contains("Very small dataset (5")));
    }
}
