//! JSONL reading helpers.

use crate::data::example::Record;
use crate::error::MlError;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Read every non-blank line of `path` as a [`Record`].
pub fn read_records(path: &Path) -> Result<Vec<Record>, MlError> {
    let file = std::fs::File::open(path)
        .map_err(|e| MlError::dataset(format!("Cannot open {}: {e}", path.display())))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            MlError::dataset(format!("{} line {}: {e}", path.display(), idx + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Number of non-blank lines in `path`.
pub fn count_records(path: &Path) -> Result<usize, MlError> {
    let file = std::fs::File::open(path)
        .map_err(|e| MlError::dataset(format!("Cannot open {}: {e}", path.display())))?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}
