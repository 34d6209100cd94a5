//! Base model download from the Hugging Face hub.

use crate::error::MlError;
use crate::runtime::PythonRuntime;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_DOWNLOAD_DIR: &str = "models/base";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Repository id in `sys.argv[1]`, target directory in `sys.argv[2]`, token
/// through `HF_TOKEN`.
const SNAPSHOT_SCRIPT: &str = r#"
import os, sys
from huggingface_hub import snapshot_download
path = snapshot_download(
    repo_id=sys.argv[1],
    local_dir=sys.argv[2],
    token=os.environ.get("HF_TOKEN") or None,
)
print(path)
"#;

pub struct ModelDownloader {
    runtime: PythonRuntime,
}

impl ModelDownloader {
    pub fn new(runtime: PythonRuntime) -> Self {
        Self { runtime }
    }

    /// Hub ids look like `owner/name`.
    pub fn validate_repo_id(repo_id: &str) -> Result<(), MlError> {
        let valid = repo_id
            .split_once('/')
            .is_some_and(|(owner, name)| {
                !owner.is_empty() && !name.is_empty() && !name.contains('/')
            })
            && !repo_id.contains(char::is_whitespace)
            && !repo_id.contains("..");
        if valid {
            Ok(())
        } else {
            Err(MlError::invalid_input(format!(
                "'{repo_id}' is not a Hugging Face repository id (expected owner/name)"
            )))
        }
    }

    /// Snapshot-download `repo_id` into `output_dir`.
    pub async fn download(
        &self,
        repo_id: &str,
        output_dir: &Path,
        token: Option<&str>,
    ) -> Result<PathBuf, MlError> {
        Self::validate_repo_id(repo_id)?;
        std::fs::create_dir_all(output_dir)?;
        info!(repo_id, output = %output_dir.display(), "Downloading model");

        let args = vec![repo_id.to_string(), output_dir.display().to_string()];
        let mut envs = Vec::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            envs.push(("HF_TOKEN", token));
        }
        self.runtime
            .run_script(SNAPSHOT_SCRIPT, &args, &envs, Some(DOWNLOAD_TIMEOUT))
            .await
            .map_err(|e| MlError::model(format!("download of {repo_id} failed: {e}")))?;

        info!(repo_id, output = %output_dir.display(), "Model downloaded");
        Ok(output_dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_repo_id() {
        assert!(ModelDownloader::validate_repo_id("mlx-community/Llama-3.2-3B-Instruct-4bit").is_ok());
        for bad in ["", "llama", "/name", "owner/", "a/b/c", "own er/name", "../x"] {
            assert!(
                ModelDownloader::validate_repo_id(bad).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_script_reads_argv_and_env() {
        assert!(SNAPSHOT_SCRIPT.contains("sys.argv[1]"));
        assert!(SNAPSHOT_SCRIPT.contains("HF_TOKEN"));
    }
}
