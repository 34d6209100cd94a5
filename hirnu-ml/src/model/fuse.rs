//! Merge LoRA adapters into base weights with `mlx_lm.fuse`.

use crate::error::MlError;
use crate::runtime::PythonRuntime;
use crate::training::checkpoint::ADAPTER_FILE;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::info;

pub const FUSE_MODULE: &str = "mlx_lm.fuse";

/// Architectures the GGUF exporter understands.
pub const GGUF_MODEL_TYPES: &[&str] = &["llama", "mixtral", "mistral"];

const FUSE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

static QUANTIZED_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^|[-_/])\d+-?bit($|[-_])").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseRequest {
    pub base_model: String,
    pub adapter_path: PathBuf,
    pub output: PathBuf,
    pub de_quantize: bool,
    pub export_gguf: bool,
}

/// What can be learned about a base model before fusing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BaseModelInfo {
    quantized: bool,
    model_type: Option<String>,
}

impl BaseModelInfo {
    /// Reads `config.json` for local models; hub ids are judged by name.
    fn inspect(base_model: &str) -> Result<Self, MlError> {
        let config = Path::new(base_model).join("config.json");
        if config.is_file() {
            let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&config)?)?;
            return Ok(Self {
                quantized: value.get("quantization").is_some_and(|q| !q.is_null()),
                model_type: value
                    .get("model_type")
                    .and_then(|t| t.as_str())
                    .map(str::to_string),
            });
        }
        Ok(Self {
            quantized: QUANTIZED_NAME_RE.is_match(base_model),
            model_type: None,
        })
    }
}

impl FuseRequest {
    pub fn validate(&self) -> Result<(), MlError> {
        if !self.adapter_path.is_dir() {
            return Err(MlError::not_found(format!(
                "adapter directory {}",
                self.adapter_path.display()
            )));
        }
        if !self.adapter_path.join(ADAPTER_FILE).is_file() {
            return Err(MlError::not_found(format!(
                "{ADAPTER_FILE} in {}",
                self.adapter_path.display()
            )));
        }
        if self.base_model.trim().is_empty() {
            return Err(MlError::invalid_input("base model must not be empty"));
        }

        if self.export_gguf {
            let info = BaseModelInfo::inspect(&self.base_model)?;
            if info.quantized && !self.de_quantize {
                return Err(MlError::invalid_input(
                    "quantized models cannot be exported to GGUF; add --de-quantize",
                ));
            }
            if let Some(model_type) = &info.model_type {
                if !GGUF_MODEL_TYPES.contains(&model_type.as_str()) {
                    return Err(MlError::invalid_input(format!(
                        "model type {model_type} is not supported for GGUF export (supported: {})",
                        GGUF_MODEL_TYPES.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.base_model.clone(),
            "--adapter-path".to_string(),
            self.adapter_path.display().to_string(),
            "--save-path".to_string(),
            self.output.display().to_string(),
        ];
        if self.de_quantize {
            args.push("--de-quantize".to_string());
        }
        if self.export_gguf {
            args.push("--export-gguf".to_string());
        }
        args
    }
}

pub struct ModelFuser {
    runtime: PythonRuntime,
}

impl ModelFuser {
    pub fn new(runtime: PythonRuntime) -> Self {
        Self { runtime }
    }

    pub fn describe(&self, request: &FuseRequest) -> String {
        self.runtime.describe(FUSE_MODULE, &request.args())
    }

    /// Returns the directory holding the fused model.
    pub async fn fuse(&self, request: &FuseRequest) -> Result<PathBuf, MlError> {
        request.validate()?;
        if let Some(parent) = request.output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(
            base = %request.base_model,
            adapter = %request.adapter_path.display(),
            output = %request.output.display(),
            "Fusing adapters"
        );
        self.runtime
            .run_module(FUSE_MODULE, &request.args(), Some(FUSE_TIMEOUT))
            .await
            .map_err(|e| MlError::model(format!("fuse failed: {e}")))?;
        info!(output = %request.output.display(), "Fused model saved");
        Ok(request.output.clone())
    }
}
