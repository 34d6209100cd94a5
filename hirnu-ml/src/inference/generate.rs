//! Generation backends.

use crate::error::MlError;
use crate::runtime::PythonRuntime;
use crate::training::checkpoint::ADAPTER_FILE;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const GENERATE_MODULE: &str = "mlx_lm.generate";

/// Local directory consulted when a model path turns out to hold only
/// adapters.
pub const DEFAULT_BASE_MODEL_DIR: &str = "models/base";

const SEPARATOR: &str = "==========";

/// Prefix of the line carrying the JSON array of batch outputs.
const BATCH_MARKER: &str = "HIRNU_BATCH_OUTPUT ";

/// Model in `sys.argv[1]`, adapter directory (or empty) in `sys.argv[2]`,
/// JSON array of requests in `sys.argv[3]`. Loads the model once.
const BATCH_SCRIPT: &str = r#"
import json, sys
from mlx_lm import generate, load
from mlx_lm.sample_utils import make_sampler
model, tokenizer = load(sys.argv[1], adapter_path=sys.argv[2] or None)
outputs = []
for req in json.loads(sys.argv[3]):
    messages = []
    if req.get("system"):
        messages.append({"role": "system", "content": req["system"]})
    messages.append({"role": "user", "content": req["prompt"]})
    if getattr(tokenizer, "chat_template", None):
        prompt = tokenizer.apply_chat_template(
            messages, tokenize=False, add_generation_prompt=True
        )
    else:
        prompt = req["prompt"]
    text = generate(
        model,
        tokenizer,
        prompt=prompt,
        max_tokens=req["max_tokens"],
        sampler=make_sampler(temp=req["temperature"]),
    )
    outputs.append(text.strip())
print("HIRNU_BATCH_OUTPUT " + json.dumps(outputs))
"#;

/// One generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: usize,
    pub temperature: f64,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: 200,
            temperature: 0.7,
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Anything that turns a prompt into text.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, MlError>;

    /// One output per request, in order.
    async fn generate_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<String>, MlError> {
        let mut outputs = Vec::with_capacity(requests.len());
        for request in requests {
            outputs.push(self.generate(request).await?);
        }
        Ok(outputs)
    }
}

/// Base model plus optional adapter directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLocation {
    pub model: String,
    pub adapter: Option<PathBuf>,
}

impl ModelLocation {
    /// Resolve against [`DEFAULT_BASE_MODEL_DIR`].
    pub fn resolve(model: &str, adapter: Option<PathBuf>) -> Self {
        Self::resolve_with_base(model, adapter, Path::new(DEFAULT_BASE_MODEL_DIR))
    }

    /// A directory with `adapters.safetensors` but no `config.json` is an
    /// adapter directory; when no adapter was given explicitly and `base_dir`
    /// exists, it becomes the adapter and `base_dir` the model.
    pub fn resolve_with_base(model: &str, adapter: Option<PathBuf>, base_dir: &Path) -> Self {
        let path = Path::new(model);
        let adapter_only = path.is_dir()
            && !path.join("config.json").exists()
            && path.join(ADAPTER_FILE).exists();

        if adapter_only && adapter.is_none() {
            if base_dir.exists() {
                info!(
                    adapter = %path.display(),
                    base = %base_dir.display(),
                    "Model path is an adapter directory, using local base model"
                );
                return Self {
                    model: base_dir.display().to_string(),
                    adapter: Some(path.to_path_buf()),
                };
            }
            warn!(
                path = %path.display(),
                "Model path looks like an adapter directory but {} is missing; pass --adapter-path with a base model",
                base_dir.display()
            );
        }

        Self {
            model: model.to_string(),
            adapter,
        }
    }
}

/// Generates through `python -m mlx_lm.generate`.
#[derive(Debug, Clone)]
pub struct MlxGenerator {
    runtime: PythonRuntime,
    location: ModelLocation,
}

impl MlxGenerator {
    pub fn new(runtime: PythonRuntime, location: ModelLocation) -> Self {
        Self { runtime, location }
    }

    pub fn location(&self) -> &ModelLocation {
        &self.location
    }

    pub fn build_args(&self, request: &GenerationRequest) -> Vec<String> {
        let mut args = vec!["--model".to_string(), self.location.model.clone()];
        if let Some(adapter) = &self.location.adapter {
            args.push("--adapter-path".to_string());
            args.push(adapter.display().to_string());
        }
        args.extend([
            "--prompt".to_string(),
            request.prompt.clone(),
            "--max-tokens".to_string(),
            request.max_tokens.to_string(),
            "--temp".to_string(),
            request.temperature.to_string(),
        ]);
        if let Some(system) = &request.system {
            args.push("--system-prompt".to_string());
            args.push(system.clone());
        }
        args
    }

    /// Arguments for [`BATCH_SCRIPT`].
    pub fn build_batch_args(&self, requests: &[GenerationRequest]) -> Result<Vec<String>, MlError> {
        Ok(vec![
            self.location.model.clone(),
            self.location
                .adapter
                .as_ref()
                .map(|a| a.display().to_string())
                .unwrap_or_default(),
            serde_json::to_string(requests)?,
        ])
    }
}

#[async_trait]
impl Generator for MlxGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, MlError> {
        let args = self.build_args(request);
        let stdout = self
            .runtime
            .run_module(GENERATE_MODULE, &args, None)
            .await
            .map_err(|e| MlError::inference(e.to_string()))?;
        let text = extract_generation(&stdout);
        debug!(chars = text.len(), "Generated text");
        Ok(text)
    }

    async fn generate_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<String>, MlError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let args = self.build_batch_args(requests)?;
        let stdout = self
            .runtime
            .run_script(BATCH_SCRIPT, &args, &[], None)
            .await
            .map_err(|e| MlError::inference(e.to_string()))?;
        let outputs = parse_batch_output(&stdout, requests.len())?;
        debug!(count = outputs.len(), "Generated batch");
        Ok(outputs)
    }
}

/// Decode the marker line printed by the batch script.
pub fn parse_batch_output(stdout: &str, expected: usize) -> Result<Vec<String>, MlError> {
    let payload = stdout
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix(BATCH_MARKER))
        .ok_or_else(|| MlError::inference("batch generation printed no output line"))?;
    let outputs: Vec<String> = serde_json::from_str(payload)?;
    if outputs.len() != expected {
        return Err(MlError::inference(format!(
            "batch generation returned {} outputs for {expected} prompts",
            outputs.len()
        )));
    }
    Ok(outputs)
}

/// Text between the first two separator lines, or the whole output when the
/// framework printed none.
pub fn extract_generation(stdout: &str) -> String {
    let mut lines = stdout.lines();
    if !lines.any(|l| l.trim() == SEPARATOR) {
        return stdout.trim().to_string();
    }
    lines
        .take_while(|l| l.trim() != SEPARATOR)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
