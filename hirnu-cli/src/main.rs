//! Hirnu CLI: data preparation, fine-tuning, evaluation and inference for
//! the Hirnu language model.

mod commands;
mod repl;

use clap::Parser;
use hirnu_core::RecordFormat;
use hirnu_core::config::{DEFAULT_TRAINING_CONFIG, resolve_config_path};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const FALLBACK_LOG_DIR: &str = "outputs/logs";

/// Fine-tune and query a language model on the Hirnu conlang
#[derive(Parser, Debug)]
#[command(name = "hirnu", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (relative paths in configs resolve against it)
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Parse raw sources, split, write JSONL and validate
    Prepare {
        /// Data configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Only validate the existing split files
        #[arg(long, conflicts_with = "skip_validation")]
        validate_only: bool,
        /// Do not validate the written files
        #[arg(long)]
        skip_validation: bool,
    },
    /// Schema-check JSONL dataset files
    Validate {
        /// Data configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Record format (defaults to the configured one)
        #[arg(short, long)]
        format: Option<RecordFormat>,
        /// Files to check (defaults to the three configured splits)
        files: Vec<PathBuf>,
    },
    /// Fine-tune the base model with LoRA through mlx_lm
    Train {
        /// Training configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Data configuration file, used to locate the default splits
        #[arg(long)]
        data_config: Option<PathBuf>,
        /// Training split (defaults to <processed_data_dir>/train.jsonl)
        #[arg(long)]
        train_data: Option<PathBuf>,
        /// Validation split (defaults to <processed_data_dir>/valid.jsonl)
        #[arg(long)]
        valid_data: Option<PathBuf>,
        /// Resume from "latest", a checkpoint directory or an adapter file
        #[arg(long)]
        resume_from: Option<String>,
        /// Override training.num_epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Override training.batch_size
        #[arg(long)]
        batch_size: Option<usize>,
        /// Print the planned command without running it
        #[arg(long)]
        dry_run: bool,
    },
    /// Score a model on a held-out JSONL dataset
    Evaluate {
        /// Base model id, model directory or adapter directory
        #[arg(long)]
        model_path: String,
        /// LoRA adapter directory
        #[arg(long)]
        adapter_path: Option<PathBuf>,
        /// Test data
        #[arg(long, default_value = hirnu_ml::eval::DEFAULT_TEST_DATA)]
        test_data: PathBuf,
        /// Where to write the results JSON
        #[arg(short, long, default_value = hirnu_ml::eval::DEFAULT_RESULTS_PATH)]
        output: PathBuf,
        #[arg(long, default_value_t = 200)]
        max_tokens: usize,
        #[arg(long, default_value_t = 0.0)]
        temperature: f64,
        /// Prompts generated per model load (defaults to
        /// evaluation.eval_batch_size)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Also compute test loss and perplexity with mlx_lm.lora --test
        #[arg(long)]
        with_loss: bool,
        /// Training configuration file (Python runtime settings)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate text or translate; interactive when neither --prompt nor
    /// --translate is given
    Infer {
        /// Base model id, model directory or adapter directory
        #[arg(long)]
        model_path: String,
        /// LoRA adapter directory
        #[arg(long)]
        adapter_path: Option<PathBuf>,
        /// Free-form prompt
        #[arg(short, long, conflicts_with = "translate")]
        prompt: Option<String>,
        /// Text to translate
        #[arg(short, long)]
        translate: Option<String>,
        /// Source language for --translate and interactive mode
        #[arg(long, default_value = "english")]
        from: String,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = 200)]
        max_tokens: usize,
        #[arg(long, default_value_t = 0.7)]
        temperature: f64,
        /// Training configuration file (Python runtime settings)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Merge trained adapters into the base model
    Fuse {
        /// Directory holding adapters.safetensors
        #[arg(long)]
        adapter_path: PathBuf,
        /// Where to save the fused model
        #[arg(short, long)]
        output: PathBuf,
        /// Base model (defaults to model.name from the training config)
        #[arg(long)]
        base_model: Option<String>,
        #[arg(long)]
        de_quantize: bool,
        #[arg(long)]
        export_gguf: bool,
        /// Training configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Download a base model from the Hugging Face hub
    Download {
        /// Repository id (defaults to model.name from the training config)
        #[arg(long)]
        model_id: Option<String>,
        #[arg(long, default_value = hirnu_ml::model::DEFAULT_DOWNLOAD_DIR)]
        output_dir: PathBuf,
        /// Access token for gated models (falls back to HF_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// Training configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Check the Python environment and configuration files
    Doctor {
        /// Training configuration file (Python runtime settings)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Manage configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write default data_config.yaml and training_config.yaml
    Init {
        #[arg(long, default_value = "configs")]
        dir: PathBuf,
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration after file and environment layering
    Show {
        #[arg(long)]
        data_config: Option<PathBuf>,
        #[arg(long)]
        training_config: Option<PathBuf>,
    },
}

impl Commands {
    /// Training config file named on the command line, if any.
    fn training_config(&self) -> Option<&Path> {
        match self {
            Commands::Train { config, .. }
            | Commands::Evaluate { config, .. }
            | Commands::Infer { config, .. }
            | Commands::Fuse { config, .. }
            | Commands::Download { config, .. }
            | Commands::Doctor { config } => config.as_deref(),
            Commands::Config {
                action: ConfigAction::Show { training_config, .. },
            } => training_config.as_deref(),
            _ => None,
        }
    }
}

/// Logging settings from the training config, without failing: a broken
/// config is reported later by the command itself.
fn logging_hint(command: &Commands) -> (PathBuf, Option<&'static str>) {
    let logging = resolve_config_path(command.training_config(), DEFAULT_TRAINING_CONFIG)
        .filter(|p| p.exists())
        .and_then(|p| hirnu_core::load_training_config(Some(&p)).ok())
        .map(|c| c.logging);
    match logging {
        Some(logging) => {
            let level = logging.level_filter();
            (logging.log_dir, level)
        }
        None => (PathBuf::from(FALLBACK_LOG_DIR), None),
    }
}

/// `-q` and `-v` win over the configured level.
fn stderr_filter(verbose: u8, quiet: bool, configured: Option<&'static str>) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => configured.unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.workspace != Path::new(".") {
        std::env::set_current_dir(&cli.workspace).map_err(|e| {
            anyhow::anyhow!("Cannot enter workspace {}: {e}", cli.workspace.display())
        })?;
    }

    // Load .env file if present
    let _ = dotenvy::dotenv();

    let (log_dir, configured_level) = logging_hint(&cli.command);

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(stderr_filter(
            cli.verbose,
            cli.quiet,
            configured_level,
        )));

    // JSON file layer for structured logging
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "hirnu.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command).await
}
