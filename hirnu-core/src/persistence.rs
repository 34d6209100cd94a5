//! File persistence helpers shared by every pipeline stage.
//!
//! Whole-file writes go through a `.tmp` sibling followed by a rename so an
//! interrupted run never leaves a half-written manifest or config behind.
//! Event logs are append-only JSONL.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Atomically write pretty-printed JSON to `path`.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write YAML to `path`.
pub fn atomic_write_yaml<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let yaml = serde_yaml::to_string(data).map_err(io::Error::other)?;
    atomic_write(path, yaml.as_bytes())
}

/// Atomically write raw bytes to `path`, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Append one compact JSON object as a line to a JSONL file.
pub fn append_jsonl<T: serde::Serialize>(path: &Path, record: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let entry = Entry {
            name: "checkpoint".into(),
            count: 3,
        };

        atomic_write_json(&path, &entry).unwrap();
        let loaded: Option<Entry> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(entry));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("config.yaml");
        atomic_write_yaml(&path, &Entry {
            name: "x".into(),
            count: 1,
        })
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("name: x"));
    }

    #[test]
    fn test_load_json_missing_file() {
        let loaded: io::Result<Option<Entry>> = load_json(Path::new("/nonexistent/manifest.json"));
        assert!(loaded.unwrap().is_none());
    }

    #[test]
    fn test_append_jsonl_accumulates_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("metrics.jsonl");
        for count in 0..3 {
            append_jsonl(&path, &Entry {
                name: "event".into(),
                count,
            })
            .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: Entry = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last.count, 2);
    }
}
