//! LoRA fine-tuning driver around `mlx_lm.lora`.

use crate::data::jsonl;
use crate::error::MlError;
use crate::runtime::{tail_lines, PythonRuntime};
use crate::training::callbacks::{
    CallbackAction, CheckpointCallback, DivergenceGuard, EarlyStoppingCallback, Logs,
    MetricsLogger, TrainingCallback,
};
use crate::training::checkpoint::CheckpointManager;
use crate::training::events::{self, TrainerEvent};
use crate::training::metrics::TrainingMetrics;
use chrono::{DateTime, Utc};
use hirnu_core::persistence;
use hirnu_core::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

pub const LORA_MODULE: &str = "mlx_lm.lora";
pub const MLX_CONFIG_FILE: &str = "lora_config.yaml";
pub const SUMMARY_FILE: &str = "training_summary.json";

const STDERR_TAIL: usize = 40;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Completed,
    EarlyStopped,
    Diverged,
    Interrupted,
    Failed,
}

/// Everything resolved before the subprocess starts.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingPlan {
    pub train_data: PathBuf,
    pub valid_data: PathBuf,
    /// Directory handed to `--data`.
    pub data_dir: PathBuf,
    /// Whether the data files must be copied into `data_dir` first.
    pub needs_staging: bool,
    pub train_examples: usize,
    pub valid_examples: usize,
    pub iterations_per_epoch: usize,
    pub total_iterations: usize,
    pub mlx_config_path: PathBuf,
    pub resume_adapter: Option<PathBuf>,
    pub args: Vec<String>,
    pub command: String,
}

/// Result of a finished (not failed) run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub status: TrainingStatus,
    pub stopped_by: Option<String>,
    pub metrics: TrainingMetrics,
    pub adapter_path: PathBuf,
    pub summary_path: PathBuf,
}

#[derive(Serialize)]
struct TrainingSummary<'a> {
    status: TrainingStatus,
    stopped_by: Option<&'a str>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    total_iterations: usize,
    adapter_path: &'a Path,
    checkpoint_dir: &'a Path,
    metrics: &'a TrainingMetrics,
    config: &'a TrainingConfig,
}

// `mlx_lm.lora --config` file layout.
#[derive(Serialize)]
struct MlxLoraFile {
    fine_tune_type: &'static str,
    optimizer: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    optimizer_config: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lr_schedule: Option<LrSchedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lora_parameters: Option<LoraParameters>,
}

#[derive(Serialize)]
struct LrSchedule {
    name: &'static str,
    warmup: usize,
    warmup_init: f64,
    arguments: Vec<f64>,
}

#[derive(Serialize)]
struct LoraParameters {
    keys: Vec<String>,
    rank: u32,
    scale: f64,
    dropout: f64,
}

/// Qualify bare projection names with their transformer sub-block.
fn module_key(name: &str) -> String {
    if name.contains('.') {
        return name.to_string();
    }
    match name {
        "q_proj" | "k_proj" | "v_proj" | "o_proj" => format!("self_attn.{name}"),
        "gate_proj" | "up_proj" | "down_proj" => format!("mlp.{name}"),
        other => other.to_string(),
    }
}

/// Derives epoch boundaries from completed iterations.
struct EpochTracker {
    iterations_per_epoch: usize,
    num_epochs: usize,
    current: usize,
    train_losses: Vec<f64>,
    val_loss: Option<f64>,
}

impl EpochTracker {
    fn new(iterations_per_epoch: usize, num_epochs: usize) -> Self {
        Self {
            iterations_per_epoch,
            num_epochs,
            current: 1,
            train_losses: Vec::new(),
            val_loss: None,
        }
    }

    /// Close every epoch that ends at or before `completed` iterations,
    /// returning `(epoch, logs)` for each.
    fn advance(&mut self, completed: usize) -> Vec<(usize, Logs)> {
        let mut closed = Vec::new();
        while self.current <= self.num_epochs
            && completed >= self.current * self.iterations_per_epoch
        {
            let mut logs = Logs::new();
            if !self.train_losses.is_empty() {
                let mean =
                    self.train_losses.iter().sum::<f64>() / self.train_losses.len() as f64;
                logs.insert("train_loss".into(), mean);
            }
            if let Some(val) = self.val_loss.take() {
                logs.insert("val_loss".into(), val);
            }
            self.train_losses.clear();
            closed.push((self.current, logs));
            self.current += 1;
        }
        closed
    }

    fn has_next(&self) -> bool {
        self.current <= self.num_epochs
    }
}

struct RunState {
    metrics: TrainingMetrics,
    epochs: EpochTracker,
}

/// Fine-tunes a base model on JSONL chat data through `mlx_lm.lora`.
pub struct HirnuTrainer {
    config: TrainingConfig,
    runtime: PythonRuntime,
    train_data: PathBuf,
    valid_data: PathBuf,
    resume_from: Option<String>,
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl HirnuTrainer {
    pub fn new(
        config: TrainingConfig,
        runtime: PythonRuntime,
        train_data: PathBuf,
        valid_data: PathBuf,
    ) -> Self {
        Self {
            config,
            runtime,
            train_data,
            valid_data,
            resume_from: None,
            callbacks: Vec::new(),
        }
    }

    /// Register the metrics logger, checkpoint recorder, divergence guard and,
    /// when enabled, early stopping.
    pub fn with_default_callbacks(mut self) -> Self {
        self.add_callback(Box::new(MetricsLogger::new(&self.config.logging.log_dir)));
        self.add_callback(Box::new(CheckpointCallback::new(self.checkpoint_manager())));
        self.add_callback(Box::new(DivergenceGuard::new()));
        if self.config.early_stopping.enabled {
            self.add_callback(Box::new(EarlyStoppingCallback::from_config(
                &self.config.early_stopping,
            )));
        }
        self
    }

    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    /// Resume from `latest`, a checkpoint directory or an adapter file.
    pub fn resume_from(mut self, target: Option<String>) -> Self {
        self.resume_from = target;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(
            self.config.checkpointing.checkpoint_dir.clone(),
            self.config.checkpointing.keep_last_n,
        )
    }

    /// `ceil(train_examples / batch_size)`, at least one.
    pub fn iterations_per_epoch(&self, train_examples: usize) -> usize {
        train_examples
            .div_ceil(self.config.training.batch_size.max(1))
            .max(1)
    }

    pub fn calculate_total_iterations(&self, train_examples: usize) -> usize {
        (self.config.training.num_epochs * self.iterations_per_epoch(train_examples)).max(1)
    }

    /// Validate inputs and resolve the full command line without running it.
    pub fn plan(&self) -> Result<TrainingPlan, MlError> {
        for (name, path) in [("Training", &self.train_data), ("Validation", &self.valid_data)] {
            if !path.is_file() {
                return Err(MlError::not_found(format!(
                    "{name} data {}",
                    path.display()
                )));
            }
        }
        let train_examples = jsonl::count_records(&self.train_data)?;
        let valid_examples = jsonl::count_records(&self.valid_data)?;
        if train_examples == 0 {
            return Err(MlError::dataset(format!(
                "{} contains no examples",
                self.train_data.display()
            )));
        }
        if valid_examples == 0 {
            return Err(MlError::dataset(format!(
                "{} contains no examples",
                self.valid_data.display()
            )));
        }

        let (data_dir, needs_staging) = match self.train_data.parent() {
            Some(dir)
                if self.train_data.file_name().is_some_and(|n| n == "train.jsonl")
                    && self.valid_data.file_name().is_some_and(|n| n == "valid.jsonl")
                    && self.valid_data.parent() == Some(dir) =>
            {
                (dir.to_path_buf(), false)
            }
            _ => (self.config.checkpointing.checkpoint_dir.join("data"), true),
        };

        let resume_adapter = self
            .resume_from
            .as_deref()
            .map(|target| self.checkpoint_manager().resolve_resume(target))
            .transpose()?;

        let iterations_per_epoch = self.iterations_per_epoch(train_examples);
        let total_iterations = self.calculate_total_iterations(train_examples);
        let mlx_config_path = self.config.model.output_dir.join(MLX_CONFIG_FILE);
        let args = self.build_args(
            &data_dir,
            total_iterations,
            &mlx_config_path,
            resume_adapter.as_deref(),
        );
        let command = self.runtime.describe(LORA_MODULE, &args);

        Ok(TrainingPlan {
            train_data: self.train_data.clone(),
            valid_data: self.valid_data.clone(),
            data_dir,
            needs_staging,
            train_examples,
            valid_examples,
            iterations_per_epoch,
            total_iterations,
            mlx_config_path,
            resume_adapter,
            args,
            command,
        })
    }

    fn build_args(
        &self,
        data_dir: &Path,
        total_iterations: usize,
        mlx_config: &Path,
        resume: Option<&Path>,
    ) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "--model".to_string(),
            c.model.name.clone(),
            "--train".to_string(),
            "--data".to_string(),
            data_dir.display().to_string(),
            "--config".to_string(),
            mlx_config.display().to_string(),
            "--batch-size".to_string(),
            c.training.batch_size.to_string(),
            "--iters".to_string(),
            total_iterations.to_string(),
            "--learning-rate".to_string(),
            c.training.learning_rate.to_string(),
            "--num-layers".to_string(),
            c.training.num_layers.to_string(),
            "--steps-per-report".to_string(),
            c.logging.log_steps.max(1).to_string(),
            "--steps-per-eval".to_string(),
            c.evaluation.eval_steps.max(1).to_string(),
            "--val-batches".to_string(),
            c.evaluation.val_batches.to_string(),
            "--save-every".to_string(),
            c.checkpointing.save_steps.max(1).to_string(),
            "--adapter-path".to_string(),
            c.model.output_dir.display().to_string(),
            "--max-seq-length".to_string(),
            c.training.max_seq_length.to_string(),
            "--seed".to_string(),
            c.training.seed.to_string(),
        ];
        if c.training.gradient_accumulation_steps > 1 {
            args.push("--grad-accumulation-steps".to_string());
            args.push(c.training.gradient_accumulation_steps.to_string());
        }
        if let Some(resume) = resume {
            args.push("--resume-adapter-file".to_string());
            args.push(resume.display().to_string());
        }
        args
    }

    /// The `--config` YAML handed to the framework.
    pub fn mlx_config_yaml(&self, total_iterations: usize) -> Result<String, MlError> {
        let c = &self.config;
        let optimizer = c.training.optimizer.to_ascii_lowercase();
        let mut optimizer_config = BTreeMap::new();
        if optimizer == "adamw" {
            optimizer_config.insert(
                optimizer.clone(),
                BTreeMap::from([("weight_decay".to_string(), c.training.weight_decay)]),
            );
        }
        let lr_schedule = (c.training.warmup_steps > 0).then(|| LrSchedule {
            name: "cosine_decay",
            warmup: c.training.warmup_steps.min(total_iterations),
            warmup_init: 0.0,
            arguments: vec![c.training.learning_rate, total_iterations as f64, 0.0],
        });
        let lora_parameters = c.lora.use_lora.then(|| LoraParameters {
            keys: c.lora.target_modules.iter().map(|m| module_key(m)).collect(),
            rank: c.lora.rank,
            scale: c.lora.scale(),
            dropout: c.lora.dropout,
        });
        let file = MlxLoraFile {
            fine_tune_type: if c.lora.use_lora { "lora" } else { "full" },
            optimizer,
            optimizer_config,
            lr_schedule,
            lora_parameters,
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    fn stage_data(&self, plan: &TrainingPlan) -> Result<(), MlError> {
        if !plan.needs_staging {
            return Ok(());
        }
        std::fs::create_dir_all(&plan.data_dir)?;
        std::fs::copy(&plan.train_data, plan.data_dir.join("train.jsonl"))?;
        std::fs::copy(&plan.valid_data, plan.data_dir.join("valid.jsonl"))?;
        info!(dir = %plan.data_dir.display(), "Staged training data");
        Ok(())
    }

    /// Run training to completion, early stop, divergence or interrupt.
    pub async fn train(&mut self) -> Result<TrainingOutcome, MlError> {
        let plan = self.plan()?;
        self.stage_data(&plan)?;
        std::fs::create_dir_all(&self.config.model.output_dir)?;
        std::fs::create_dir_all(&self.config.checkpointing.checkpoint_dir)?;
        persistence::atomic_write(
            &plan.mlx_config_path,
            self.mlx_config_yaml(plan.total_iterations)?.as_bytes(),
        )?;

        info!(
            model = %self.config.model.name,
            train_examples = plan.train_examples,
            iterations = plan.total_iterations,
            epochs = self.config.training.num_epochs,
            "Starting training"
        );

        let started_at = Utc::now();
        let mut run = RunState {
            metrics: TrainingMetrics::default(),
            epochs: EpochTracker::new(plan.iterations_per_epoch, self.config.training.num_epochs),
        };

        let begin_logs = Logs::from([
            ("total_iterations".to_string(), plan.total_iterations as f64),
            ("train_examples".to_string(), plan.train_examples as f64),
            ("valid_examples".to_string(), plan.valid_examples as f64),
            ("num_epochs".to_string(), self.config.training.num_epochs as f64),
        ]);
        for cb in &mut self.callbacks {
            cb.on_train_begin(&begin_logs);
            cb.on_epoch_begin(1, &Logs::new());
        }

        let mut child = self.runtime.spawn_module(LORA_MODULE, &plan.args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MlError::training("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MlError::training("stderr not captured"))?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let (mut out_open, mut err_open) = (true, true);
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;
        let mut stopped_by: Option<String> = None;

        while out_open || err_open {
            let line = tokio::select! {
                _ = &mut ctrl_c => {
                    interrupted = true;
                    break;
                }
                line = out_lines.next_line(), if out_open => match line {
                    Ok(Some(line)) => line,
                    _ => {
                        out_open = false;
                        continue;
                    }
                },
                line = err_lines.next_line(), if err_open => match line {
                    Ok(Some(line)) => {
                        if stderr_tail.len() == STDERR_TAIL {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line.clone());
                        line
                    }
                    _ => {
                        err_open = false;
                        continue;
                    }
                },
            };

            debug!(target: "mlx_lm", "{line}");
            if let Some(event) = events::parse_line(&line) {
                if let Some(name) = self.handle_event(event, &mut run) {
                    stopped_by = Some(name);
                    break;
                }
            }
        }

        if interrupted || stopped_by.is_some() {
            child.kill().await?;
        }
        let exit = child.wait().await?;
        run.metrics.total_training_time_secs =
            (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;

        let status = if interrupted {
            TrainingStatus::Interrupted
        } else if let Some(name) = &stopped_by {
            if name == "divergence_guard" {
                TrainingStatus::Diverged
            } else {
                TrainingStatus::EarlyStopped
            }
        } else if exit.success() {
            for (epoch, logs) in run.epochs.advance(plan.total_iterations) {
                run.metrics.record_epoch(logs.get("train_loss").copied());
                for cb in &mut self.callbacks {
                    cb.on_epoch_end(epoch, &logs);
                }
            }
            TrainingStatus::Completed
        } else {
            TrainingStatus::Failed
        };

        let end_logs = self.end_logs(&run.metrics);
        for cb in &mut self.callbacks {
            cb.on_train_end(&end_logs);
        }

        let summary_path = self.config.model.output_dir.join(SUMMARY_FILE);
        let summary = TrainingSummary {
            status,
            stopped_by: stopped_by.as_deref(),
            started_at,
            finished_at: Utc::now(),
            total_iterations: plan.total_iterations,
            adapter_path: &self.config.model.output_dir,
            checkpoint_dir: &self.config.checkpointing.checkpoint_dir,
            metrics: &run.metrics,
            config: &self.config,
        };
        if let Err(e) = persistence::atomic_write_json(&summary_path, &summary) {
            warn!(path = %summary_path.display(), error = %e, "Failed to write training summary");
        }

        match status {
            TrainingStatus::Interrupted => {
                warn!("Training interrupted by user");
                Err(MlError::Interrupted(format!(
                    "training stopped at iteration {}; adapters saved so far are in {} and {}",
                    run.metrics.iterations_completed,
                    self.config.model.output_dir.display(),
                    self.config.checkpointing.checkpoint_dir.display()
                )))
            }
            TrainingStatus::Failed => {
                let stderr: Vec<String> = stderr_tail.into_iter().collect();
                Err(MlError::training(format!(
                    "{LORA_MODULE} exited with {exit}: {}",
                    tail_lines(&stderr.join("\n"), 20)
                )))
            }
            _ => {
                info!(
                    status = ?status,
                    iterations = run.metrics.iterations_completed,
                    best_val_loss = ?run.metrics.best_val_loss,
                    "Training finished"
                );
                Ok(TrainingOutcome {
                    status,
                    stopped_by,
                    metrics: run.metrics,
                    adapter_path: self.config.model.output_dir.clone(),
                    summary_path,
                })
            }
        }
    }

    fn end_logs(&self, metrics: &TrainingMetrics) -> Logs {
        let mut logs = Logs::from([
            (
                "iterations_completed".to_string(),
                metrics.iterations_completed as f64,
            ),
            ("epochs_completed".to_string(), metrics.epochs_completed as f64),
        ]);
        if let Some(loss) = metrics.last_train_loss() {
            logs.insert("final_train_loss".into(), loss);
        }
        if let Some(loss) = metrics.best_val_loss {
            logs.insert("best_val_loss".into(), loss);
        }
        logs
    }

    /// Apply one event. Returns the name of the first callback asking to
    /// stop, if any.
    fn handle_event(&mut self, event: TrainerEvent, run: &mut RunState) -> Option<String> {
        let mut stop = None;
        match event {
            TrainerEvent::TrainReport {
                iteration,
                loss,
                learning_rate,
                tokens_per_sec,
                peak_memory_gb,
            } => {
                run.metrics.record_train(iteration, loss, peak_memory_gb);
                run.epochs.train_losses.push(loss);

                let mut logs = Logs::from([("train_loss".to_string(), loss)]);
                for (key, value) in [
                    ("learning_rate", learning_rate),
                    ("tokens_per_sec", tokens_per_sec),
                    ("peak_memory_gb", peak_memory_gb),
                ] {
                    if let Some(v) = value {
                        logs.insert(key.to_string(), v);
                    }
                }
                for cb in &mut self.callbacks {
                    if cb.on_batch_end(iteration, &logs) == CallbackAction::Stop && stop.is_none()
                    {
                        stop = Some(cb.name().to_string());
                    }
                }
                if stop.is_none() {
                    stop = self.close_epochs(iteration, run);
                }
            }
            TrainerEvent::ValReport { iteration, loss } => {
                // Validation at iteration `n` runs before step `n` trains.
                stop = self.close_epochs(iteration.saturating_sub(1), run);
                run.metrics.record_val(iteration, loss);
                run.epochs.val_loss = Some(loss);
                info!(iteration, val_loss = loss, "Validation");
            }
            TrainerEvent::AdapterSaved { iteration, path } => {
                let mut logs = Logs::new();
                if let Some(loss) = run.metrics.last_train_loss() {
                    logs.insert("train_loss".into(), loss);
                }
                if let Some(loss) = run.metrics.last_val_loss() {
                    logs.insert("val_loss".into(), loss);
                }
                for cb in &mut self.callbacks {
                    cb.on_checkpoint(iteration, &path, &logs);
                }
            }
            TrainerEvent::FinalSaved { path } => {
                info!(path = %path.display(), "Final adapter weights saved");
            }
            TrainerEvent::TestReport { loss, perplexity } => {
                run.metrics.test_loss = Some(loss);
                run.metrics.test_perplexity = Some(perplexity);
            }
        }
        stop
    }

    fn close_epochs(&mut self, completed: usize, run: &mut RunState) -> Option<String> {
        let mut stop = None;
        for (epoch, logs) in run.epochs.advance(completed) {
            run.metrics.record_epoch(logs.get("train_loss").copied());
            info!(epoch, ?logs, "Epoch complete");
            for cb in &mut self.callbacks {
                if cb.on_epoch_end(epoch, &logs) == CallbackAction::Stop && stop.is_none() {
                    stop = Some(cb.name().to_string());
                }
            }
            if stop.is_some() {
                return stop;
            }
            if run.epochs.has_next() {
                for cb in &mut self.callbacks {
                    cb.on_epoch_begin(run.epochs.current, &Logs::new());
                }
            }
        }
        stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_lines(path: &Path, n: usize) {
        let line = "{\"messages\":[{\"role\":\"user\",\"content\":\"q\"},{\"role\":\"assistant\",\"content\":\"a\"}]}\n";
        std::fs::write(path, line.repeat(n)).unwrap();
    }

    fn trainer(dir: &Path, train: PathBuf, valid: PathBuf) -> HirnuTrainer {
        let mut config = TrainingConfig::default();
        config.model.output_dir = dir.join("out");
        config.checkpointing.checkpoint_dir = dir.join("ckpt");
        config.logging.log_dir = dir.join("logs");
        HirnuTrainer::new(config, PythonRuntime::new(dir.to_path_buf()), train, valid)
    }

    #[test]
    fn test_iteration_math() {
        let tmp = TempDir::new().unwrap();
        let t = trainer(tmp.path(), PathBuf::new(), PathBuf::new());
        assert_eq!(t.iterations_per_epoch(10), 3);
        assert_eq!(t.iterations_per_epoch(8), 2);
        assert_eq!(t.iterations_per_epoch(0), 1);
        assert_eq!(t.calculate_total_iterations(10), 9);
    }

    #[test]
    fn test_plan_uses_split_dir_directly() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("processed");
        std::fs::create_dir_all(&data).unwrap();
        write_lines(&data.join("train.jsonl"), 9);
        write_lines(&data.join("valid.jsonl"), 2);

        let plan = trainer(tmp.path(), data.join("train.jsonl"), data.join("valid.jsonl"))
            .plan()
            .unwrap();
        assert!(!plan.needs_staging);
        assert_eq!(plan.data_dir, data);
        assert_eq!(plan.train_examples, 9);
        assert_eq!(plan.total_iterations, 9);
        assert!(plan.args.windows(2).any(|w| w[0] == "--iters" && w[1] == "9"));
        assert!(plan.command.contains("-m mlx_lm.lora"));
        assert!(plan.resume_adapter.is_none());
    }

    #[test]
    fn test_plan_stages_renamed_files() {
        let tmp = TempDir::new().unwrap();
        write_lines(&tmp.path().join("a.jsonl"), 4);
        write_lines(&tmp.path().join("b.jsonl"), 1);
        let plan = trainer(tmp.path(), tmp.path().join("a.jsonl"), tmp.path().join("b.jsonl"))
            .plan()
            .unwrap();
        assert!(plan.needs_staging);
        assert_eq!(plan.data_dir, tmp.path().join("ckpt").join("data"));
    }

    #[test]
    fn test_plan_rejects_missing_and_empty_data() {
        let tmp = TempDir::new().unwrap();
        let t = trainer(tmp.path(), tmp.path().join("train.jsonl"), tmp.path().join("valid.jsonl"));
        assert!(matches!(t.plan(), Err(MlError::NotFound(_))));

        write_lines(&tmp.path().join("train.jsonl"), 0);
        write_lines(&tmp.path().join("valid.jsonl"), 1);
        assert!(matches!(t.plan(), Err(MlError::Dataset(_))));
    }

    #[test]
    fn test_plan_resume_latest_without_checkpoints() {
        let tmp = TempDir::new().unwrap();
        write_lines(&tmp.path().join("train.jsonl"), 4);
        write_lines(&tmp.path().join("valid.jsonl"), 1);
        let t = trainer(tmp.path(), tmp.path().join("train.jsonl"), tmp.path().join("valid.jsonl"))
            .resume_from(Some("latest".into()));
        assert!(matches!(t.plan(), Err(MlError::NotFound(_))));
    }

    #[test]
    fn test_mlx_config_yaml() {
        let tmp = TempDir::new().unwrap();
        let t = trainer(tmp.path(), PathBuf::new(), PathBuf::new());
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&t.mlx_config_yaml(300).unwrap()).unwrap();
        assert_eq!(yaml["fine_tune_type"], "lora");
        assert_eq!(yaml["lora_parameters"]["rank"], 8);
        assert_eq!(yaml["lora_parameters"]["scale"], 2.0);
        assert_eq!(yaml["lora_parameters"]["keys"][0], "self_attn.q_proj");
        assert_eq!(yaml["optimizer_config"]["adamw"]["weight_decay"], 0.01);
        assert_eq!(yaml["lr_schedule"]["warmup"], 100);
    }

    #[test]
    fn test_full_fine_tune_has_no_lora_parameters() {
        let tmp = TempDir::new().unwrap();
        let mut t = trainer(tmp.path(), PathBuf::new(), PathBuf::new());
        t.config.lora.use_lora = false;
        t.config.training.warmup_steps = 0;
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&t.mlx_config_yaml(10).unwrap()).unwrap();
        assert_eq!(yaml["fine_tune_type"], "full");
        assert!(yaml.get("lora_parameters").is_none());
        assert!(yaml.get("lr_schedule").is_none());
    }

    #[test]
    fn test_module_key() {
        assert_eq!(module_key("v_proj"), "self_attn.v_proj");
        assert_eq!(module_key("down_proj"), "mlp.down_proj");
        assert_eq!(module_key("self_attn.q_proj"), "self_attn.q_proj");
    }

    #[test]
    fn test_epoch_tracker() {
        let mut tracker = EpochTracker::new(10, 3);
        tracker.train_losses.extend([2.0, 1.0]);
        tracker.val_loss = Some(1.4);
        assert!(tracker.advance(9).is_empty());

        let closed = tracker.advance(20);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].0, 1);
        assert_eq!(closed[0].1.get("train_loss"), Some(&1.5));
        assert_eq!(closed[0].1.get("val_loss"), Some(&1.4));
        assert!(closed[1].1.is_empty());
        assert!(tracker.has_next());

        assert_eq!(tracker.advance(100).len(), 1);
        assert!(!tracker.has_next());
    }

    struct StopAtEpoch(usize);

    impl TrainingCallback for StopAtEpoch {
        fn name(&self) -> &str {
            "stop_at_epoch"
        }

        fn on_epoch_end(&mut self, epoch: usize, _logs: &Logs) -> CallbackAction {
            if epoch >= self.0 {
                CallbackAction::Stop
            } else {
                CallbackAction::Continue
            }
        }
    }

    #[test]
    fn test_handle_event_dispatch() {
        let tmp = TempDir::new().unwrap();
        let mut t = trainer(tmp.path(), PathBuf::new(), PathBuf::new());
        t.add_callback(Box::new(StopAtEpoch(2)));
        let mut run = RunState {
            metrics: TrainingMetrics::default(),
            epochs: EpochTracker::new(5, 3),
        };

        let report = |iteration, loss| TrainerEvent::TrainReport {
            iteration,
            loss,
            learning_rate: None,
            tokens_per_sec: None,
            peak_memory_gb: None,
        };

        assert_eq!(t.handle_event(TrainerEvent::ValReport { iteration: 1, loss: 3.0 }, &mut run), None);
        assert_eq!(t.handle_event(report(5, 2.0), &mut run), None);
        assert_eq!(run.metrics.epochs_completed, 1);
        assert_eq!(
            t.handle_event(report(10, 1.0), &mut run),
            Some("stop_at_epoch".to_string())
        );
        assert_eq!(run.metrics.epochs_completed, 2);
        assert_eq!(run.metrics.best_val_loss, Some(3.0));
    }
}
