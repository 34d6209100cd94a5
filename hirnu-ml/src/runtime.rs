//! Python runtime manager for MLX-LM workloads.
//!
//! Every model-side operation (training, generation, fusion, download) runs as
//! a `python -m mlx_lm.<tool>` subprocess or a short inline script. This module
//! owns interpreter resolution, working directory, timeouts and error mapping.

use crate::error::MlError;
use hirnu_core::config::PythonConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// Information about the detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Managed Python subprocess runner.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
    timeout: Duration,
}

impl PythonRuntime {
    /// Create a runtime using `python3` from `PATH`.
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workspace,
            timeout: Duration::from_secs(600),
        }
    }

    /// Create from the `python` section of the training configuration.
    /// A virtual environment is auto-detected when none is configured.
    pub fn from_config(config: &PythonConfig, workspace: PathBuf) -> Self {
        let venv_path = config
            .venv_path
            .clone()
            .or_else(|| detect_venv(&workspace));
        Self {
            python_path: config
                .python_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("python3")),
            venv_path,
            workspace,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Detect an available Python installation.
    pub async fn detect() -> Result<PythonInfo, MlError> {
        for cmd in &["python3", "python"] {
            let output = Command::new(cmd).arg("--version").output().await;

            if let Ok(output) = output {
                if output.status.success() {
                    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    let version = if version.is_empty() {
                        String::from_utf8_lossy(&output.stderr).trim().to_string()
                    } else {
                        version
                    };
                    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                    return Ok(PythonInfo {
                        path: PathBuf::from(cmd),
                        version,
                        venv_path: detect_venv(&cwd),
                    });
                }
            }
        }

        Err(MlError::Python(
            "Python not found. Install Python 3.9+ with mlx-lm to train Hirnu models.".to_string(),
        ))
    }

    /// Effective interpreter (accounting for a virtual environment).
    pub fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    /// Build a `python -m <module> <args...>` command rooted at the workspace.
    pub fn module_command<I, S>(&self, module: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(self.python_cmd());
        cmd.arg("-m")
            .arg(module)
            .args(args)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Human-readable rendering of a module invocation, for dry runs and logs.
    pub fn describe(&self, module: &str, args: &[String]) -> String {
        let mut parts = vec![
            self.python_cmd().display().to_string(),
            "-m".to_string(),
            module.to_string(),
        ];
        parts.extend(args.iter().map(|a| {
            if a.contains(char::is_whitespace) {
                format!("\"{a}\"")
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }

    /// Spawn a module with piped stdout/stderr for line-by-line supervision.
    pub fn spawn_module(&self, module: &str, args: &[String]) -> Result<Child, MlError> {
        debug!(command = %self.describe(module, args), "Spawning Python module");
        self.module_command(module, args)
            .spawn()
            .map_err(|e| MlError::Python(format!("Failed to spawn Python: {e}")))
    }

    /// Run a module to completion and return its stdout.
    pub async fn run_module(
        &self,
        module: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<String, MlError> {
        debug!(command = %self.describe(module, args), "Running Python module");
        let cmd = self.module_command(module, args);
        self.collect(cmd, timeout.unwrap_or(self.timeout)).await
    }

    /// Run an inline Python script.
    ///
    /// Arguments are passed through `sys.argv[1:]` and environment variables
    /// through `envs`, never interpolated into the script text.
    pub async fn run_script(
        &self,
        script: &str,
        args: &[String],
        envs: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<String, MlError> {
        debug!(script_len = script.len(), "Running Python script");
        let mut cmd = Command::new(self.python_cmd());
        cmd.arg("-c")
            .arg(script)
            .args(args)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        self.collect(cmd, timeout.unwrap_or(self.timeout)).await
    }

    async fn collect(&self, mut cmd: Command, timeout: Duration) -> Result<String, MlError> {
        let result = tokio::time::timeout(timeout, async {
            let output = cmd
                .output()
                .await
                .map_err(|e| MlError::Python(format!("Failed to spawn Python: {e}")))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(MlError::Python(format!(
                    "Python exited with {}: {}",
                    output.status,
                    tail_lines(&stderr, 20)
                )));
            }

            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(MlError::Timeout(format!(
                "Python process timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Check which Python packages import successfully.
    pub async fn check_packages(&self, packages: &[&str]) -> HashMap<String, bool> {
        let mut results = HashMap::new();

        for pkg in packages {
            let available = Command::new(self.python_cmd())
                .args(["-c", "import importlib, sys; importlib.import_module(sys.argv[1])"])
                .arg(pkg)
                .output()
                .await
                .is_ok_and(|o| o.status.success());

            results.insert(pkg.to_string(), available);
        }

        results
    }
}

/// Last `n` non-empty lines of process output, for error messages.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Detect a virtual environment from `VIRTUAL_ENV` or common directory names.
fn detect_venv(workspace: &std::path::Path) -> Option<PathBuf> {
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let path = PathBuf::from(venv);
        if path.exists() {
            return Some(path);
        }
    }

    for name in &[".venv", "venv"] {
        let path = workspace.join(name);
        if path.join("pyvenv.cfg").exists() {
            return Some(path);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_python_detect() {
        // Python may or may not be installed where tests run.
        if let Ok(info) = PythonRuntime::detect().await {
            assert!(!info.version.is_empty());
        }
    }

    #[test]
    fn test_python_cmd_prefers_venv() {
        let config = PythonConfig {
            python_path: Some(PathBuf::from("/usr/bin/python3.11")),
            venv_path: Some(PathBuf::from("/opt/hirnu/.venv")),
            timeout_secs: 30,
        };
        let runtime = PythonRuntime::from_config(&config, PathBuf::from("."));
        let expected = if cfg!(windows) {
            PathBuf::from("/opt/hirnu/.venv/Scripts/python")
        } else {
            PathBuf::from("/opt/hirnu/.venv/bin/python")
        };
        assert_eq!(runtime.python_cmd(), expected);
        assert_eq!(runtime.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_describe_quotes_whitespace() {
        let runtime = PythonRuntime::new(PathBuf::from("."));
        let rendered = runtime.describe(
            "mlx_lm.generate",
            &["--prompt".to_string(), "hello there".to_string()],
        );
        assert!(rendered.ends_with("-m mlx_lm.generate --prompt \"hello there\""));
    }

    #[test]
    fn test_tail_lines() {
        let text = "a\n\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), "a\nb\nc\nd");
    }
}
