//! Subcommand handlers.

use crate::{Commands, ConfigAction};
use anyhow::{Context, bail};
use hirnu_core::config::{
    DEFAULT_DATA_CONFIG, DEFAULT_TRAINING_CONFIG, resolve_config_path,
};
use hirnu_core::{DataConfig, RecordFormat, TrainingConfig, load_data_config, load_training_config};
use hirnu_ml::data::{DatasetValidator, PrepareReport, SplitsReport, prepare};
use hirnu_ml::eval::{EvaluationReport, Evaluator, LossProbe};
use hirnu_ml::inference::{
    GenerationRequest, Generator, Language, MlxGenerator, ModelLocation, Translator,
};
use hirnu_ml::model::{FuseRequest, ModelDownloader, ModelFuser};
use hirnu_ml::training::{HirnuTrainer, TrainingOutcome, TrainingPlan};
use hirnu_ml::PythonRuntime;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::info;

pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Prepare {
            config,
            validate_only,
            skip_validation,
        } => handle_prepare(config.as_deref(), validate_only, skip_validation),
        Commands::Validate {
            config,
            format,
            files,
        } => handle_validate(config.as_deref(), format, files),
        Commands::Train {
            config,
            data_config,
            train_data,
            valid_data,
            resume_from,
            epochs,
            batch_size,
            dry_run,
        } => {
            let mut training = load_training(config.as_deref())?;
            apply_overrides(&mut training, epochs, batch_size)?;
            let (default_train, _, default_valid) = load_data(data_config.as_deref())?.split_paths();
            handle_train(
                training,
                train_data.unwrap_or(default_train),
                valid_data.unwrap_or(default_valid),
                resume_from,
                dry_run,
            )
            .await
        }
        Commands::Evaluate {
            model_path,
            adapter_path,
            test_data,
            output,
            max_tokens,
            temperature,
            batch_size,
            with_loss,
            config,
        } => {
            let training = load_training(config.as_deref())?;
            let location = ModelLocation::resolve(&model_path, adapter_path);
            handle_evaluate(
                runtime(&training),
                location,
                &test_data,
                &output,
                EvalSettings {
                    max_tokens,
                    temperature,
                    batch_size: batch_size.unwrap_or(training.evaluation.eval_batch_size),
                    with_loss,
                },
            )
            .await
        }
        Commands::Infer {
            model_path,
            adapter_path,
            prompt,
            translate,
            from,
            system,
            max_tokens,
            temperature,
            config,
        } => {
            let runtime = runtime(&load_training(config.as_deref())?);
            let location = ModelLocation::resolve(&model_path, adapter_path);
            let generator = MlxGenerator::new(runtime, location);
            let source: Language = from.parse()?;
            let settings = crate::repl::SessionSettings {
                source,
                system,
                max_tokens,
                temperature,
            };
            handle_infer(&generator, prompt, translate, settings).await
        }
        Commands::Fuse {
            adapter_path,
            output,
            base_model,
            de_quantize,
            export_gguf,
            config,
        } => {
            let training = load_training(config.as_deref())?;
            let request = FuseRequest {
                base_model: base_model.unwrap_or_else(|| training.model.name.clone()),
                adapter_path,
                output,
                de_quantize,
                export_gguf,
            };
            handle_fuse(runtime(&training), request).await
        }
        Commands::Download {
            model_id,
            output_dir,
            token,
            config,
        } => {
            let training = load_training(config.as_deref())?;
            let model_id = model_id.unwrap_or_else(|| training.model.name.clone());
            let token = token.or_else(|| std::env::var("HF_TOKEN").ok());
            handle_download(runtime(&training), &model_id, &output_dir, token.as_deref()).await
        }
        Commands::Doctor { config } => handle_doctor(config.as_deref()).await,
        Commands::Config { action } => handle_config(action),
    }
}

// ---------------------------------------------------------------------------
// Configuration helpers
// ---------------------------------------------------------------------------

fn load_data(explicit: Option<&Path>) -> anyhow::Result<DataConfig> {
    let path = resolve_config_path(explicit, DEFAULT_DATA_CONFIG);
    load_data_config(path.as_deref()).context("Failed to load data configuration")
}

fn load_training(explicit: Option<&Path>) -> anyhow::Result<TrainingConfig> {
    let path = resolve_config_path(explicit, DEFAULT_TRAINING_CONFIG);
    load_training_config(path.as_deref()).context("Failed to load training configuration")
}

/// Apply command-line overrides, then re-check the result.
fn apply_overrides(
    config: &mut TrainingConfig,
    epochs: Option<usize>,
    batch_size: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(epochs) = epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(batch_size) = batch_size {
        config.training.batch_size = batch_size;
    }
    config.validate().context("Invalid training overrides")?;
    Ok(())
}

/// The process has already moved into the workspace.
fn runtime(config: &TrainingConfig) -> PythonRuntime {
    PythonRuntime::from_config(&config.python, PathBuf::from("."))
}

fn rule() -> String {
    "=".repeat(60)
}

// ---------------------------------------------------------------------------
// prepare / validate
// ---------------------------------------------------------------------------

fn handle_prepare(
    config_path: Option<&Path>,
    validate_only: bool,
    skip_validation: bool,
) -> anyhow::Result<()> {
    let config = load_data(config_path)?;

    if validate_only {
        let (train, test, valid) = config.split_paths();
        let report = DatasetValidator::new(config.format.kind).validate_splits(&train, &test, &valid);
        return finish_validation(&report);
    }

    let report = prepare(&config, skip_validation)?;
    print_prepare_report(&report);
    match &report.validation {
        Some(validation) => finish_validation(validation),
        None => Ok(()),
    }
}

fn print_prepare_report(report: &PrepareReport) {
    println!("{}", rule());
    println!("Hirnu Data Preparation");
    println!("{}", rule());
    println!("  Files read:        {}", report.stats.files_read);
    if report.stats.files_skipped > 0 {
        println!("  Files skipped:     {}", report.stats.files_skipped);
    }
    println!("  Pairs parsed:      {}", report.stats.pairs_parsed);
    println!("  Malformed skipped: {}", report.stats.malformed);
    println!("  Length filtered:   {}", report.stats.length_filtered);
    println!("  Total examples:    {}", report.total_examples);
    println!();
    for (name, split) in [
        ("Train", &report.train),
        ("Test", &report.test),
        ("Valid", &report.valid),
    ] {
        println!("  {name:<6} {:>6}  {}", split.count, split.path.display());
    }
    println!();
}

fn finish_validation(report: &SplitsReport) -> anyhow::Result<()> {
    println!("{report}");
    if !report.all_valid {
        bail!("dataset validation failed");
    }
    Ok(())
}

fn handle_validate(
    config_path: Option<&Path>,
    format: Option<RecordFormat>,
    files: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_data(config_path)?;
    let validator = DatasetValidator::new(format.unwrap_or(config.format.kind));

    if files.is_empty() {
        let (train, test, valid) = config.split_paths();
        return finish_validation(&validator.validate_splits(&train, &test, &valid));
    }

    let mut invalid = 0;
    for file in &files {
        let report = validator.validate_file(file);
        println!("{report}");
        if !report.valid {
            invalid += 1;
        }
    }
    if invalid > 0 {
        bail!("{invalid} of {} files failed validation", files.len());
    }
    println!("All files are valid");
    Ok(())
}

// ---------------------------------------------------------------------------
// train
// ---------------------------------------------------------------------------

async fn handle_train(
    config: TrainingConfig,
    train_data: PathBuf,
    valid_data: PathBuf,
    resume_from: Option<String>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let runtime = runtime(&config);
    let mut trainer = HirnuTrainer::new(config, runtime, train_data, valid_data)
        .resume_from(resume_from)
        .with_default_callbacks();

    let plan = trainer.plan()?;
    print_plan(trainer.config(), &plan);
    if dry_run {
        println!("Dry run: nothing was executed.");
        return Ok(());
    }

    let outcome = trainer.train().await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_plan(config: &TrainingConfig, plan: &TrainingPlan) {
    println!("{}", rule());
    println!("Hirnu LoRA Fine-tuning");
    println!("{}", rule());
    println!("  Model:            {}", config.model.name);
    println!(
        "  Train examples:   {} ({})",
        plan.train_examples,
        plan.train_data.display()
    );
    println!(
        "  Valid examples:   {} ({})",
        plan.valid_examples,
        plan.valid_data.display()
    );
    println!(
        "  Epochs:           {} x {} iterations",
        config.training.num_epochs, plan.iterations_per_epoch
    );
    println!("  Total iterations: {}", plan.total_iterations);
    println!(
        "  LoRA:             rank {}, alpha {}, dropout {}",
        config.lora.rank, config.lora.alpha, config.lora.dropout
    );
    if let Some(resume) = &plan.resume_adapter {
        println!("  Resuming from:    {}", resume.display());
    }
    println!("  Output:           {}", config.model.output_dir.display());
    println!();
    println!("  {}", plan.command);
    println!();
}

fn print_outcome(outcome: &TrainingOutcome) {
    println!();
    println!("{}", rule());
    println!("Training finished: {:?}", outcome.status);
    if let Some(by) = &outcome.stopped_by {
        println!("  Stopped by:       {by}");
    }
    let metrics = &outcome.metrics;
    println!("  Iterations:       {}", metrics.iterations_completed);
    println!("  Epochs:           {}", metrics.epochs_completed);
    if let Some(loss) = metrics.last_train_loss() {
        println!("  Final train loss: {loss:.4}");
    }
    if let (Some(loss), Some(iteration)) = (metrics.best_val_loss, metrics.best_iteration) {
        println!("  Best val loss:    {loss:.4} (iteration {iteration})");
    }
    println!("  Adapters:         {}", outcome.adapter_path.display());
    println!("  Summary:          {}", outcome.summary_path.display());
    println!("{}", rule());
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} ({eta})",
    ) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

struct EvalSettings {
    max_tokens: usize,
    temperature: f64,
    batch_size: usize,
    with_loss: bool,
}

async fn handle_evaluate(
    runtime: PythonRuntime,
    location: ModelLocation,
    test_data: &Path,
    output: &Path,
    settings: EvalSettings,
) -> anyhow::Result<()> {
    if !test_data.is_file() {
        bail!("Test data not found: {}", test_data.display());
    }
    info!(
        model = %location.model,
        adapter = ?location.adapter,
        batch_size = settings.batch_size,
        "Evaluating model"
    );

    let generator = MlxGenerator::new(runtime.clone(), location.clone());
    let evaluator = Evaluator::new(&generator)
        .with_sampling(settings.max_tokens, settings.temperature)
        .with_batch_size(settings.batch_size);

    let pb = progress_bar();
    let mut report = evaluator
        .evaluate_file(test_data, |done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })
        .await?;
    pb.finish_and_clear();

    if settings.with_loss {
        let staging = output
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("loss-data");
        let (loss, perplexity) = LossProbe::new(runtime, location)
            .run(test_data, &staging)
            .await
            .context("Test loss computation failed")?;
        report.metrics.test_loss = Some(loss);
        report.metrics.test_perplexity = Some(perplexity);
    }

    report.save(output)?;
    print_evaluation(&report, output);
    Ok(())
}

fn print_evaluation(report: &EvaluationReport, output: &Path) {
    let m = &report.metrics;
    println!("{}", rule());
    println!("Evaluation Results");
    println!("{}", rule());
    println!("  total_examples:           {}", m.total_examples);
    if report.skipped > 0 {
        println!("  skipped (no reference):   {}", report.skipped);
    }
    println!("  exact_match_rate:         {:.4}", m.exact_match_rate);
    println!("  avg_character_error_rate: {:.4}", m.avg_character_error_rate);
    println!("  avg_word_accuracy:        {:.4}", m.avg_word_accuracy);
    println!("  bleu:                     {:.2}", m.bleu);
    if let (Some(loss), Some(ppl)) = (m.test_loss, m.test_perplexity) {
        println!("  test_loss:                {loss:.4}");
        println!("  test_perplexity:          {ppl:.4}");
    }
    println!();
    println!("Detailed results saved to: {}", output.display());
}

// ---------------------------------------------------------------------------
// infer
// ---------------------------------------------------------------------------

async fn handle_infer(
    generator: &dyn Generator,
    prompt: Option<String>,
    translate: Option<String>,
    settings: crate::repl::SessionSettings,
) -> anyhow::Result<()> {
    if let Some(text) = translate {
        let translator = Translator::new(generator)
            .with_system(settings.system.clone())
            .with_sampling(settings.max_tokens, settings.temperature);
        let output = translator
            .translate(&text, settings.source, settings.source.other())
            .await?;
        println!("{output}");
        return Ok(());
    }

    if let Some(prompt) = prompt {
        let request = GenerationRequest::new(prompt)
            .with_system(settings.system.clone())
            .with_max_tokens(settings.max_tokens)
            .with_temperature(settings.temperature);
        println!("{}", generator.generate(&request).await?);
        return Ok(());
    }

    crate::repl::run_interactive(generator, settings).await
}

// ---------------------------------------------------------------------------
// fuse / download
// ---------------------------------------------------------------------------

async fn handle_fuse(runtime: PythonRuntime, request: FuseRequest) -> anyhow::Result<()> {
    let fuser = ModelFuser::new(runtime);
    println!("Base model:   {}", request.base_model);
    println!("Adapter path: {}", request.adapter_path.display());
    println!("Output path:  {}", request.output.display());
    println!("  {}", fuser.describe(&request));

    let output = fuser.fuse(&request).await?;
    println!();
    println!("Fused model saved to: {}", output.display());
    println!("Use it without adapters:");
    println!("  hirnu infer --model-path {}", output.display());
    Ok(())
}

async fn handle_download(
    runtime: PythonRuntime,
    model_id: &str,
    output_dir: &Path,
    token: Option<&str>,
) -> anyhow::Result<()> {
    println!("Model ID:         {model_id}");
    println!("Output directory: {}", output_dir.display());
    let path = ModelDownloader::new(runtime)
        .download(model_id, output_dir, token)
        .await?;
    println!();
    println!("Model downloaded to: {}", path.display());
    println!(
        "Set model.name to \"{}\" in {DEFAULT_TRAINING_CONFIG} to train against it.",
        path.display()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// doctor
// ---------------------------------------------------------------------------

/// Python packages the pipeline shells out to.
const REQUIRED_PACKAGES: [&str; 3] = ["mlx", "mlx_lm", "huggingface_hub"];

fn found(path: &str) -> &'static str {
    if Path::new(path).is_file() {
        "found"
    } else {
        "using defaults"
    }
}

async fn handle_doctor(config_path: Option<&Path>) -> anyhow::Result<()> {
    let training = load_training(config_path)?;
    let runtime = runtime(&training);

    println!("Hirnu Doctor");
    println!("{}", rule());
    let workspace = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| runtime.workspace().display().to_string());
    println!("  Workspace:       {workspace}");
    println!("  Data config:     {}", found(DEFAULT_DATA_CONFIG));
    println!("  Training config: {}", found(DEFAULT_TRAINING_CONFIG));
    println!("  Base model:      {}", training.model.name);

    match PythonRuntime::detect().await {
        Ok(info) => println!("  Python on PATH:  {} ({})", info.version, info.path.display()),
        Err(e) => println!("  Python on PATH:  missing ({e})"),
    }
    println!("  Interpreter:     {}", runtime.python_cmd().display());
    println!("  Timeout:         {}s", runtime.timeout().as_secs());

    let packages = runtime.check_packages(&REQUIRED_PACKAGES).await;
    let mut missing = Vec::new();
    for name in REQUIRED_PACKAGES {
        let ok = packages.get(name).copied().unwrap_or(false);
        println!("  {name:<16} {}", if ok { "ok" } else { "missing" });
        if !ok {
            missing.push(name);
        }
    }
    println!("{}", rule());

    if !missing.is_empty() {
        bail!(
            "missing Python packages: {} (pip install {})",
            missing.join(", "),
            missing.join(" ").replace('_', "-")
        );
    }
    println!("  All checks passed.");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn handle_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { dir, force } => {
            let data_path = dir.join("data_config.yaml");
            let training_path = dir.join("training_config.yaml");
            for path in [&data_path, &training_path] {
                if path.exists() && !force {
                    println!(
                        "Configuration file already exists at: {} (use --force to overwrite)",
                        path.display()
                    );
                    return Ok(());
                }
            }
            DataConfig::default().save(&data_path)?;
            TrainingConfig::default().save(&training_path)?;
            println!("Created {}", data_path.display());
            println!("Created {}", training_path.display());
            Ok(())
        }
        ConfigAction::Show {
            data_config: data_path,
            training_config: training_path,
        } => {
            let data = load_data(data_path.as_deref())?;
            let training = load_training(training_path.as_deref())?;
            println!("# data configuration");
            println!("{}", serde_json::to_string_pretty(&data)?);
            println!("# training configuration");
            println!("{}", serde_json::to_string_pretty(&training)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_overrides() {
        let mut config = TrainingConfig::default();
        apply_overrides(&mut config, Some(7), Some(2)).unwrap();
        assert_eq!(config.training.num_epochs, 7);
        assert_eq!(config.training.batch_size, 2);

        assert!(apply_overrides(&mut config, None, Some(0)).is_err());
    }

    #[test]
    fn test_config_init_writes_loadable_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("configs");
        handle_config(ConfigAction::Init {
            dir: dir.clone(),
            force: false,
        })
        .unwrap();

        let data = load_data_config(Some(&dir.join("data_config.yaml"))).unwrap();
        let training = load_training_config(Some(&dir.join("training_config.yaml"))).unwrap();
        assert_eq!(data.splits.random_seed, 42);
        assert_eq!(training.lora.rank, 8);
    }

    #[test]
    fn test_config_init_keeps_existing() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("configs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("data_config.yaml"), "splits:\n  random_seed: 9\n").unwrap();

        handle_config(ConfigAction::Init {
            dir: dir.clone(),
            force: false,
        })
        .unwrap();
        let body = std::fs::read_to_string(dir.join("data_config.yaml")).unwrap();
        assert!(body.contains("random_seed: 9"));
        assert!(!dir.join("training_config.yaml").exists());
    }

    #[test]
    fn test_validate_explicit_files() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.jsonl");
        let bad = tmp.path().join("bad.jsonl");
        std::fs::write(&good, "{\"text\": \"suun\"}\n").unwrap();
        std::fs::write(&bad, "{\"prompt\": \"p\"}\n").unwrap();
        let config = tmp.path().join("data_config.yaml");
        DataConfig::default().save(&config).unwrap();

        assert!(handle_validate(Some(&config), Some(RecordFormat::Text), vec![good.clone()]).is_ok());
        assert!(handle_validate(Some(&config), Some(RecordFormat::Text), vec![good, bad]).is_err());
    }
}
