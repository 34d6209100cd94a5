//! Adapter checkpoint tracking.
//!
//! `mlx_lm.lora` writes an iteration-numbered adapter file every
//! `save_steps`. Each one is moved into `checkpoint-NNNNNNN/` under the
//! checkpoint directory and recorded in `checkpoints.json`; only the newest
//! `keep_last_n` are retained on disk.

use crate::error::MlError;
use chrono::{DateTime, Utc};
use hirnu_core::persistence;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "checkpoints.json";
pub const ADAPTER_FILE: &str = "adapters.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// A saved adapter checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub iteration: usize,
    /// Validation loss if one was reported, else the latest training loss.
    pub loss: Option<f64>,
    pub dir: PathBuf,
    pub adapter_file: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    keep_last_n: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: PathBuf, keep_last_n: usize) -> Self {
        Self {
            base_dir,
            keep_last_n: keep_last_n.max(1),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn manifest_path(&self) -> PathBuf {
        self.base_dir.join(MANIFEST_FILE)
    }

    /// Recorded checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>, MlError> {
        Ok(persistence::load_json(&self.manifest_path())?.unwrap_or_default())
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>, MlError> {
        Ok(self.list()?.into_iter().max_by_key(|c| c.iteration))
    }

    /// Checkpoint with the lowest recorded loss.
    pub fn best(&self) -> Result<Option<Checkpoint>, MlError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.loss.is_some_and(f64::is_finite))
            .min_by(|a, b| {
                a.loss
                    .partial_cmp(&b.loss)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }))
    }

    /// Move `adapter` into a numbered checkpoint directory, record it and
    /// prune older entries.
    pub fn save(
        &self,
        iteration: usize,
        loss: Option<f64>,
        adapter: &Path,
    ) -> Result<Checkpoint, MlError> {
        if !adapter.is_file() {
            return Err(MlError::not_found(format!(
                "adapter file {}",
                adapter.display()
            )));
        }

        let dir = self.base_dir.join(format!("checkpoint-{iteration:07}"));
        std::fs::create_dir_all(&dir)?;
        let adapter_file = dir.join(ADAPTER_FILE);
        move_file(adapter, &adapter_file)?;

        if let Some(config) = adapter.parent().map(|p| p.join(ADAPTER_CONFIG_FILE)) {
            if config.is_file() {
                std::fs::copy(&config, dir.join(ADAPTER_CONFIG_FILE))?;
            }
        }

        let checkpoint = Checkpoint {
            iteration,
            loss,
            hash: sha256_file(&adapter_file)?,
            size_bytes: std::fs::metadata(&adapter_file)?.len(),
            dir,
            adapter_file,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.retain(|c| c.iteration != iteration);
        checkpoints.push(checkpoint.clone());
        checkpoints.sort_by_key(|c| c.iteration);
        self.prune(&mut checkpoints);

        persistence::atomic_write_json(&self.manifest_path(), &checkpoints)?;
        info!(
            iteration,
            path = %checkpoint.dir.display(),
            "Saved checkpoint"
        );
        Ok(checkpoint)
    }

    /// Drop all but the newest `keep_last_n` entries, deleting their
    /// directories.
    fn prune(&self, checkpoints: &mut Vec<Checkpoint>) {
        let excess = checkpoints.len().saturating_sub(self.keep_last_n);
        for old in checkpoints.drain(..excess) {
            match std::fs::remove_dir_all(&old.dir) {
                Ok(()) => debug!(path = %old.dir.display(), "Removed old checkpoint"),
                Err(e) => warn!(path = %old.dir.display(), error = %e, "Failed to remove old checkpoint"),
            }
        }
    }

    /// Resolve a resume target: `latest`, a checkpoint directory, or an
    /// adapter file.
    pub fn resolve_resume(&self, target: &str) -> Result<PathBuf, MlError> {
        if target == "latest" {
            return self
                .latest()?
                .map(|c| c.adapter_file)
                .ok_or_else(|| {
                    MlError::not_found(format!(
                        "no checkpoints recorded in {}",
                        self.base_dir.display()
                    ))
                });
        }

        let path = PathBuf::from(target);
        if path.is_dir() {
            let file = path.join(ADAPTER_FILE);
            if file.is_file() {
                return Ok(file);
            }
            return Err(MlError::not_found(format!(
                "{} has no {ADAPTER_FILE}",
                path.display()
            )));
        }
        if path.is_file() {
            return Ok(path);
        }
        Err(MlError::not_found(format!("resume target {target}")))
    }
}

fn move_file(from: &Path, to: &Path) -> Result<(), MlError> {
    if std::fs::rename(from, to).is_err() {
        // Rename fails across filesystems.
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, MlError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_adapter(dir: &Path, iteration: usize) -> PathBuf {
        let path = dir.join(format!("{iteration:07}_adapters.safetensors"));
        std::fs::write(&path, format!("weights-{iteration}")).unwrap();
        path
    }

    #[test]
    fn test_save_moves_and_records() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join(ADAPTER_CONFIG_FILE), "{}").unwrap();
        let manager = CheckpointManager::new(tmp.path().join("ckpt"), 3);

        let adapter = write_adapter(&out, 100);
        let cp = manager.save(100, Some(1.5), &adapter).unwrap();

        assert!(!adapter.exists());
        assert!(cp.adapter_file.is_file());
        assert!(cp.dir.join(ADAPTER_CONFIG_FILE).is_file());
        assert!(cp.dir.ends_with("checkpoint-0000100"));
        assert_eq!(cp.size_bytes, "weights-100".len() as u64);
        assert_eq!(cp.hash.len(), 64);
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_keeps_last_n() {
        let tmp = TempDir::new().unwrap();
        let manager = CheckpointManager::new(tmp.path().join("ckpt"), 2);
        for (i, loss) in [(100, 2.0), (200, 1.0), (300, 1.5)] {
            let adapter = write_adapter(tmp.path(), i);
            manager.save(i, Some(loss), &adapter).unwrap();
        }

        let list = manager.list().unwrap();
        let iterations: Vec<usize> = list.iter().map(|c| c.iteration).collect();
        assert_eq!(iterations, vec![200, 300]);
        assert!(!tmp.path().join("ckpt/checkpoint-0000100").exists());
        assert_eq!(manager.latest().unwrap().unwrap().iteration, 300);
        assert_eq!(manager.best().unwrap().unwrap().iteration, 200);
    }

    #[test]
    fn test_resolve_resume() {
        let tmp = TempDir::new().unwrap();
        let manager = CheckpointManager::new(tmp.path().join("ckpt"), 3);
        assert!(matches!(
            manager.resolve_resume("latest"),
            Err(MlError::NotFound(_))
        ));

        let adapter = write_adapter(tmp.path(), 50);
        let cp = manager.save(50, None, &adapter).unwrap();
        assert_eq!(manager.resolve_resume("latest").unwrap(), cp.adapter_file);
        assert_eq!(
            manager.resolve_resume(cp.dir.to_str().unwrap()).unwrap(),
            cp.adapter_file
        );
        assert_eq!(
            manager
                .resolve_resume(cp.adapter_file.to_str().unwrap())
                .unwrap(),
            cp.adapter_file
        );
        assert!(manager.resolve_resume("/nonexistent/adapters").is_err());
    }

    #[test]
    fn test_missing_adapter() {
        let tmp = TempDir::new().unwrap();
        let manager = CheckpointManager::new(tmp.path().to_path_buf(), 3);
        assert!(manager.save(1, None, &tmp.path().join("nope")).is_err());
    }
}
