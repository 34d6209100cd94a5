//! Configuration system for the Hirnu pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> YAML file -> environment.
//! Two documents exist: the data configuration (`configs/data_config.yaml`)
//! driving preprocessing and splitting, and the training configuration
//! (`configs/training_config.yaml`) driving fine-tuning, evaluation and the
//! Python runtime. Both are loaded once per run and treated as immutable.

use crate::error::{ConfigError, Result};
use crate::persistence;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default location of the data configuration file.
pub const DEFAULT_DATA_CONFIG: &str = "configs/data_config.yaml";
/// Default location of the training configuration file.
pub const DEFAULT_TRAINING_CONFIG: &str = "configs/training_config.yaml";

/// Environment prefix for data configuration overrides
/// (`HIRNU_DATA_SPLITS__RANDOM_SEED=7`).
pub const DATA_ENV_PREFIX: &str = "HIRNU_DATA_";
/// Environment prefix for training configuration overrides
/// (`HIRNU_TRAIN_TRAINING__BATCH_SIZE=8`).
pub const TRAINING_ENV_PREFIX: &str = "HIRNU_TRAIN_";

// ---------------------------------------------------------------------------
// Data configuration
// ---------------------------------------------------------------------------

/// On-disk record layout of a dataset line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// `{"messages": [{"role": ..., "content": ...}, ...]}`
    #[default]
    Chat,
    /// `{"prompt": ..., "completion": ...}`
    Completion,
    /// `{"text": ...}`
    Text,
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordFormat::Chat => write!(f, "chat"),
            RecordFormat::Completion => write!(f, "completion"),
            RecordFormat::Text => write!(f, "text"),
        }
    }
}

impl FromStr for RecordFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(RecordFormat::Chat),
            "completion" => Ok(RecordFormat::Completion),
            "text" => Ok(RecordFormat::Text),
            other => Err(format!(
                "Unknown format type: '{other}' (expected chat, completion or text)"
            )),
        }
    }
}

/// Data preparation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// Input and output locations.
    #[serde(default)]
    pub data: DataPaths,
    /// Text cleaning and filtering options.
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    /// Train/test/valid split ratios.
    #[serde(default)]
    pub splits: SplitConfig,
    /// Output record format.
    #[serde(default)]
    pub format: FormatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    #[serde(default = "default_raw_data_dir")]
    pub raw_data_dir: PathBuf,
    #[serde(default = "default_processed_data_dir")]
    pub processed_data_dir: PathBuf,
    #[serde(default)]
    pub sources: DataSources,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            raw_data_dir: default_raw_data_dir(),
            processed_data_dir: default_processed_data_dir(),
            sources: DataSources::default(),
        }
    }
}

fn default_raw_data_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_processed_data_dir() -> PathBuf {
    PathBuf::from("data/processed")
}

/// Raw source directories, each holding tagged `*.txt` files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSources {
    /// `Q:` / `A:` grammar drills.
    pub grammar: PathBuf,
    /// `EN:` / `HI:` word and phrase lists.
    pub vocabulary: PathBuf,
    /// `HI:` / `EN:` parallel texts.
    pub texts: PathBuf,
}

impl Default for DataSources {
    fn default() -> Self {
        Self {
            grammar: PathBuf::from("data/raw/grammar"),
            vocabulary: PathBuf::from("data/raw/vocabulary"),
            texts: PathBuf::from("data/raw/texts"),
        }
    }
}

impl DataSources {
    /// Source directories in processing order.
    pub fn dirs(&self) -> [&Path; 3] {
        [&self.grammar, &self.vocabulary, &self.texts]
    }
}

/// Text cleaning and filtering options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default = "default_true")]
    pub normalize_whitespace: bool,
    /// Minimum combined prompt + response length in characters.
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
    /// Maximum combined prompt + response length in characters.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            normalize_whitespace: true,
            min_text_length: default_min_text_length(),
            max_text_length: default_max_text_length(),
        }
    }
}

fn default_min_text_length() -> usize {
    10
}

fn default_max_text_length() -> usize {
    4096
}

/// Split ratios and shuffle seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub train: f64,
    pub test: f64,
    pub valid: f64,
    pub random_seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train: 0.8,
            test: 0.1,
            valid: 0.1,
            random_seed: 42,
        }
    }
}

impl SplitConfig {
    /// Tolerance used when checking that the ratios sum to one.
    pub const TOLERANCE: f64 = 1e-6;

    /// Reject negative ratios and ratios that do not sum to 1.0.
    pub fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("train", self.train),
            ("test", self.test),
            ("valid", self.valid),
        ] {
            if !ratio.is_finite() || ratio < 0.0 {
                return Err(ConfigError::invalid(format!(
                    "split ratio '{name}' must be a non-negative number, got {ratio}"
                )));
            }
        }
        let sum = self.train + self.test + self.valid;
        if (sum - 1.0).abs() >= Self::TOLERANCE {
            return Err(ConfigError::invalid(format!(
                "Split ratios must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Output record format and chat template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(rename = "type", default)]
    pub kind: RecordFormat,
    #[serde(default)]
    pub chat_template: ChatTemplate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatTemplate {
    /// System message prepended to every chat example.
    #[serde(default)]
    pub system: String,
}

impl DataConfig {
    /// Check cross-field constraints not expressible through serde.
    pub fn validate(&self) -> Result<()> {
        if self.preprocessing.min_text_length > self.preprocessing.max_text_length {
            return Err(ConfigError::invalid(format!(
                "min_text_length ({}) exceeds max_text_length ({})",
                self.preprocessing.min_text_length, self.preprocessing.max_text_length
            )));
        }
        self.splits.validate()
    }

    /// Output paths for the train, test and valid JSONL files.
    pub fn split_paths(&self) -> (PathBuf, PathBuf, PathBuf) {
        let dir = &self.data.processed_data_dir;
        (
            dir.join("train.jsonl"),
            dir.join("test.jsonl"),
            dir.join("valid.jsonl"),
        )
    }

    /// Write this configuration as YAML.
    pub fn save(&self, path: &Path) -> Result<()> {
        persistence::atomic_write_yaml(path, self)?;
        tracing::info!(path = %path.display(), "Data configuration saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Training configuration
// ---------------------------------------------------------------------------

/// Complete fine-tuning configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: HyperParams,
    #[serde(default)]
    pub lora: LoraConfig,
    #[serde(default)]
    pub checkpointing: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub early_stopping: EarlyStoppingConfig,
    #[serde(default)]
    pub python: PythonConfig,
}

/// Base model and final adapter location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hugging Face model id or local path.
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Directory receiving the trained adapters.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_model_name() -> String {
    "mlx-community/Llama-3.2-3B-Instruct-4bit".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("models/hirnu-finetuned")
}

/// Optimizer and schedule hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub warmup_steps: usize,
    pub max_seq_length: usize,
    pub optimizer: String,
    pub weight_decay: f64,
    pub gradient_accumulation_steps: usize,
    /// Number of transformer layers to adapt (`-1` for all).
    pub num_layers: i32,
    pub seed: u64,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            num_epochs: 3,
            batch_size: 4,
            learning_rate: 1e-5,
            warmup_steps: 100,
            max_seq_length: 2048,
            optimizer: "adamw".to_string(),
            weight_decay: 0.01,
            gradient_accumulation_steps: 1,
            num_layers: 16,
            seed: 42,
        }
    }
}

/// LoRA adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub use_lora: bool,
    pub rank: u32,
    pub alpha: f64,
    pub dropout: f64,
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            use_lora: true,
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: ["q_proj", "v_proj", "k_proj", "o_proj"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl LoraConfig {
    /// Scale factor applied to the adapter output (`alpha / rank`).
    pub fn scale(&self) -> f64 {
        self.alpha / f64::from(self.rank.max(1))
    }
}

/// Adapter checkpoint cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub save_steps: usize,
    pub checkpoint_dir: PathBuf,
    pub keep_last_n: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_steps: 500,
            checkpoint_dir: PathBuf::from("models/checkpoints"),
            keep_last_n: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_dir: PathBuf,
    /// Report training loss every N iterations.
    pub log_steps: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: PathBuf::from("outputs/logs"),
            log_steps: 10,
        }
    }
}

impl LoggingConfig {
    /// `log_level` as a tracing filter level. Python-style names
    /// (`WARNING`, `CRITICAL`) are accepted; unknown names yield `None`.
    pub fn level_filter(&self) -> Option<&'static str> {
        match self.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => Some("trace"),
            "debug" => Some("debug"),
            "info" => Some("info"),
            "warn" | "warning" => Some("warn"),
            "error" | "critical" => Some("error"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Run validation every N iterations.
    pub eval_steps: usize,
    pub eval_batch_size: usize,
    /// Validation batches per evaluation (`-1` for the whole set).
    pub val_batches: i32,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            eval_steps: 500,
            eval_batch_size: 4,
            val_batches: 25,
        }
    }
}

/// Whether a monitored metric should go down or up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub enabled: bool,
    pub patience: usize,
    pub min_delta: f64,
    /// Metric name as it appears in epoch logs (`val_loss`, `train_loss`).
    pub metric: String,
    pub mode: MonitorMode,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            patience: 3,
            min_delta: 0.001,
            metric: "val_loss".to_string(),
            mode: MonitorMode::Min,
        }
    }
}

/// Python runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonConfig {
    /// Path to Python executable (`python3` if not set).
    #[serde(default)]
    pub python_path: Option<PathBuf>,
    /// Path to virtual environment (auto-detected if not set).
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Timeout for generation, fusion and download calls (seconds).
    /// Training runs are not bounded by it.
    #[serde(default = "default_python_timeout")]
    pub timeout_secs: u64,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            venv_path: None,
            timeout_secs: default_python_timeout(),
        }
    }
}

fn default_python_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl TrainingConfig {
    /// Check cross-field constraints not expressible through serde.
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.num_epochs == 0 {
            return Err(ConfigError::invalid("num_epochs must be at least 1"));
        }
        if t.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size must be at least 1"));
        }
        if t.gradient_accumulation_steps == 0 {
            return Err(ConfigError::invalid(
                "gradient_accumulation_steps must be at least 1",
            ));
        }
        if t.learning_rate.is_nan() || t.learning_rate <= 0.0 {
            return Err(ConfigError::invalid(format!(
                "learning_rate must be positive, got {}",
                t.learning_rate
            )));
        }
        if self.lora.use_lora && self.lora.rank == 0 {
            return Err(ConfigError::invalid("lora rank must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.lora.dropout) {
            return Err(ConfigError::invalid(format!(
                "lora dropout must be in [0, 1), got {}",
                self.lora.dropout
            )));
        }
        if self.checkpointing.keep_last_n == 0 {
            return Err(ConfigError::invalid("keep_last_n must be at least 1"));
        }
        if self.evaluation.eval_batch_size == 0 {
            return Err(ConfigError::invalid("eval_batch_size must be at least 1"));
        }
        if self.logging.level_filter().is_none() {
            return Err(ConfigError::invalid(format!(
                "unknown log_level '{}'",
                self.logging.log_level
            )));
        }
        Ok(())
    }

    /// Write this configuration as YAML.
    pub fn save(&self, path: &Path) -> Result<()> {
        persistence::atomic_write_yaml(path, self)?;
        tracing::info!(path = %path.display(), "Training configuration saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a configuration document from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`{env_prefix}SECTION__FIELD`)
/// 2. The YAML file at `path`, if given
/// 3. Built-in defaults
///
/// An explicitly given path that does not exist is an error.
pub fn load_layered<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        tracing::debug!(path = %path.display(), "Loading configuration file");
        figment = figment.merge(Yaml::file(path));
    }

    figment = figment.merge(Env::prefixed(env_prefix).split("__"));

    figment.extract().map_err(|e| ConfigError::Parse(Box::new(e)))
}

/// Load and validate the data configuration.
pub fn load_data_config(path: Option<&Path>) -> Result<DataConfig> {
    let config: DataConfig = load_layered(path, DATA_ENV_PREFIX)?;
    config.validate()?;
    Ok(config)
}

/// Load and validate the training configuration.
pub fn load_training_config(path: Option<&Path>) -> Result<TrainingConfig> {
    let config: TrainingConfig = load_layered(path, TRAINING_ENV_PREFIX)?;
    config.validate()?;
    Ok(config)
}

/// Resolve the configuration file to use: the explicit path, else the default
/// location when it exists, else none (built-in defaults).
pub fn resolve_config_path(explicit: Option<&Path>, default: &str) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = PathBuf::from(default);
            default.exists().then_some(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_split_ratios_are_valid() {
        assert!(SplitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_split_ratios_must_sum_to_one() {
        let splits = SplitConfig {
            train: 0.8,
            test: 0.15,
            valid: 0.1,
            random_seed: 1,
        };
        let err = splits.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_split_ratios_within_tolerance() {
        let splits = SplitConfig {
            train: 0.7,
            test: 0.2,
            valid: 0.1 + 1e-9,
            random_seed: 1,
        };
        assert!(splits.validate().is_ok());
    }

    #[test]
    fn test_negative_split_ratio_rejected() {
        let splits = SplitConfig {
            train: 1.2,
            test: -0.1,
            valid: -0.1,
            random_seed: 1,
        };
        assert!(splits.validate().is_err());
    }

    #[test]
    fn test_record_format_from_str() {
        assert_eq!("chat".parse::<RecordFormat>().unwrap(), RecordFormat::Chat);
        assert_eq!(
            " Completion ".parse::<RecordFormat>().unwrap(),
            RecordFormat::Completion
        );
        assert!("alpaca".parse::<RecordFormat>().is_err());
    }

    #[test]
    fn test_lora_scale() {
        let lora = LoraConfig::default();
        assert_eq!(lora.scale(), 2.0);
    }

    #[test]
    fn test_load_training_defaults() {
        let config = load_training_config(None).unwrap();
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.lora.rank, 8);
        assert_eq!(config.checkpointing.keep_last_n, 3);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let err = load_data_config(Some(Path::new("/nonexistent/data_config.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_data_config_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_config.yaml");
        std::fs::write(
            &path,
            r#"
data:
  processed_data_dir: out/processed
  sources:
    grammar: raw/grammar
    vocabulary: raw/vocab
    texts: raw/texts
preprocessing:
  min_text_length: 2
splits:
  train: 0.6
  test: 0.2
  valid: 0.2
  random_seed: 7
format:
  type: completion
  chat_template:
    system: You are a Hirnu tutor.
"#,
        )
        .unwrap();

        let config = load_data_config(Some(&path)).unwrap();
        assert_eq!(config.data.processed_data_dir, PathBuf::from("out/processed"));
        assert_eq!(config.data.sources.vocabulary, PathBuf::from("raw/vocab"));
        assert_eq!(config.preprocessing.min_text_length, 2);
        assert_eq!(config.preprocessing.max_text_length, 4096);
        assert!(config.preprocessing.normalize_whitespace);
        assert_eq!(config.splits.random_seed, 7);
        assert_eq!(config.format.kind, RecordFormat::Completion);
        assert_eq!(config.format.chat_template.system, "You are a Hirnu tutor.");
    }

    #[test]
    fn test_load_rejects_bad_ratios_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_config.yaml");
        std::fs::write(&path, "splits:\n  train: 0.9\n  test: 0.2\n  valid: 0.1\n").unwrap();
        assert!(matches!(
            load_data_config(Some(&path)),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_training_config_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training_config.yaml");
        let mut config = TrainingConfig::default();
        config.training.num_epochs = 5;
        config.lora.rank = 16;
        config.early_stopping.enabled = true;
        config.save(&path).unwrap();

        let loaded = load_training_config(Some(&path)).unwrap();
        assert_eq!(loaded.training.num_epochs, 5);
        assert_eq!(loaded.lora.rank, 16);
        assert!(loaded.early_stopping.enabled);
        assert_eq!(loaded.model.name, config.model.name);
    }

    #[test]
    fn test_training_config_validation() {
        let mut config = TrainingConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.lora.dropout = 1.5;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.evaluation.eval_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.logging.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_filter() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.level_filter(), Some("info"));
        for (name, expected) in [("DEBUG", "debug"), ("Warning", "warn"), (" critical ", "error")] {
            logging.log_level = name.into();
            assert_eq!(logging.level_filter(), Some(expected));
        }
        logging.log_level = "verbose".into();
        assert_eq!(logging.level_filter(), None);
    }

    #[test]
    fn test_split_paths() {
        let config = DataConfig::default();
        let (train, test, valid) = config.split_paths();
        assert_eq!(train, PathBuf::from("data/processed/train.jsonl"));
        assert_eq!(test, PathBuf::from("data/processed/test.jsonl"));
        assert_eq!(valid, PathBuf::from("data/processed/valid.jsonl"));
    }
}
