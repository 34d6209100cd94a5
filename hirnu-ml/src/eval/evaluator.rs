//! Dataset evaluation through a [`Generator`].

use crate::data::example::Record;
use crate::data::jsonl;
use crate::error::MlError;
use crate::eval::metrics::{BatchScores, TranslationScores, perplexity};
use crate::inference::generate::{GenerationRequest, Generator, ModelLocation};
use crate::runtime::PythonRuntime;
use crate::training::events::{TrainerEvent, parse_line};
use crate::training::trainer::LORA_MODULE;
use hirnu_core::persistence;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_TEST_DATA: &str = "data/processed/test.jsonl";
pub const DEFAULT_RESULTS_PATH: &str = "outputs/results/evaluation.json";
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// What the model is asked and what it should answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalCase {
    pub system: Option<String>,
    pub prompt: String,
    pub reference: String,
}

impl EvalCase {
    /// Plain text records carry no separate reference and yield `None`.
    pub fn from_record(record: &Record) -> Option<Self> {
        match record {
            Record::Chat(example) => {
                let prompt = example.user_turns().collect::<Vec<_>>().join("\n");
                let reference = example.last_assistant()?.to_string();
                if prompt.trim().is_empty() {
                    return None;
                }
                Some(Self {
                    system: example
                        .system()
                        .filter(|s| !s.trim().is_empty())
                        .map(str::to_string),
                    prompt,
                    reference,
                })
            }
            Record::Completion { prompt, completion } => Some(Self {
                system: None,
                prompt: prompt.clone(),
                reference: completion.clone(),
            }),
            Record::Text { .. } => None,
        }
    }
}

/// One scored prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub index: usize,
    #[serde(flatten)]
    pub case: EvalCase,
    pub prediction: String,
    pub metrics: TranslationScores,
}

/// `{metrics, results}` as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub metrics: BatchScores,
    pub skipped: usize,
    pub results: Vec<CaseResult>,
}

impl EvaluationReport {
    pub fn save(&self, path: &Path) -> Result<(), MlError> {
        persistence::atomic_write_json(path, self)?;
        info!(path = %path.display(), "Evaluation results saved");
        Ok(())
    }
}

/// Runs every case of a dataset through a generator and scores the answers.
pub struct Evaluator<'a> {
    generator: &'a dyn Generator,
    max_tokens: usize,
    temperature: f64,
    batch_size: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(generator: &'a dyn Generator) -> Self {
        let defaults = GenerationRequest::new("");
        Self {
            generator,
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Cases handed to [`Generator::generate_batch`] at once. Zero is read
    /// as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_sampling(mut self, max_tokens: usize, temperature: f64) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// `progress` is called with `(done, total)` after each case.
    pub async fn evaluate_records(
        &self,
        records: &[Record],
        mut progress: impl FnMut(usize, usize),
    ) -> Result<EvaluationReport, MlError> {
        let cases: Vec<EvalCase> = records.iter().filter_map(EvalCase::from_record).collect();
        let skipped = records.len() - cases.len();
        if skipped > 0 {
            warn!(skipped, "Records without a reference answer were skipped");
        }
        if cases.is_empty() {
            return Err(MlError::evaluation(
                "dataset has no records with a prompt and a reference answer",
            ));
        }

        let total = cases.len();
        let mut results = Vec::with_capacity(total);
        for chunk in cases.chunks(self.batch_size) {
            let requests: Vec<GenerationRequest> = chunk
                .iter()
                .map(|case| {
                    GenerationRequest::new(case.prompt.clone())
                        .with_system(case.system.clone())
                        .with_max_tokens(self.max_tokens)
                        .with_temperature(self.temperature)
                })
                .collect();
            let predictions = self.generator.generate_batch(&requests).await?;
            if predictions.len() != chunk.len() {
                return Err(MlError::evaluation(format!(
                    "generator returned {} predictions for {} prompts",
                    predictions.len(),
                    chunk.len()
                )));
            }
            for (case, prediction) in chunk.iter().zip(predictions) {
                let index = results.len();
                let metrics = TranslationScores::score(&prediction, &case.reference);
                results.push(CaseResult {
                    index,
                    case: case.clone(),
                    prediction,
                    metrics,
                });
                progress(index + 1, total);
            }
        }

        let (predictions, references): (Vec<String>, Vec<String>) = results
            .iter()
            .map(|r| (r.prediction.clone(), r.case.reference.clone()))
            .unzip();
        let metrics = BatchScores::evaluate(&predictions, &references)?;
        info!(
            examples = metrics.total_examples,
            exact_match = metrics.exact_match_rate,
            bleu = metrics.bleu,
            "Evaluation complete"
        );

        Ok(EvaluationReport {
            metrics,
            skipped,
            results,
        })
    }

    pub async fn evaluate_file(
        &self,
        path: &Path,
        progress: impl FnMut(usize, usize),
    ) -> Result<EvaluationReport, MlError> {
        if !path.is_file() {
            return Err(MlError::not_found(format!("test data {}", path.display())));
        }
        let records = jsonl::read_records(path)?;
        info!(path = %path.display(), records = records.len(), "Loaded evaluation data");
        self.evaluate_records(&records, progress).await
    }
}

/// Average test loss from `mlx_lm.lora --test`.
#[derive(Debug, Clone)]
pub struct LossProbe {
    runtime: PythonRuntime,
    location: ModelLocation,
}

impl LossProbe {
    pub fn new(runtime: PythonRuntime, location: ModelLocation) -> Self {
        Self { runtime, location }
    }

    /// The framework reads `test.jsonl` from a data directory; other file
    /// names are copied into `staging_dir` first.
    pub fn data_dir(test_file: &Path, staging_dir: &Path) -> Result<PathBuf, MlError> {
        if test_file.file_name().is_some_and(|n| n == "test.jsonl") {
            if let Some(parent) = test_file.parent() {
                return Ok(if parent.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    parent.to_path_buf()
                });
            }
        }
        std::fs::create_dir_all(staging_dir)?;
        std::fs::copy(test_file, staging_dir.join("test.jsonl"))?;
        Ok(staging_dir.to_path_buf())
    }

    pub fn args(&self, data_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.location.model.clone(),
            "--data".to_string(),
            data_dir.display().to_string(),
            "--test".to_string(),
        ];
        if let Some(adapter) = &self.location.adapter {
            args.push("--adapter-path".to_string());
            args.push(adapter.display().to_string());
        }
        args
    }

    /// Returns `(loss, perplexity)`.
    pub async fn run(&self, test_file: &Path, staging_dir: &Path) -> Result<(f64, f64), MlError> {
        let data_dir = Self::data_dir(test_file, staging_dir)?;
        let stdout = self
            .runtime
            .run_module(LORA_MODULE, &self.args(&data_dir), None)
            .await?;
        parse_test_report(&stdout)
    }
}

/// Find the test report line in framework output.
pub fn parse_test_report(stdout: &str) -> Result<(f64, f64), MlError> {
    stdout
        .lines()
        .find_map(|line| match parse_line(line) {
            Some(TrainerEvent::TestReport { loss, perplexity: ppl }) => Some((loss, ppl)),
            _ => None,
        })
        .or_else(|| {
            // Older releases print only the loss.
            stdout.lines().find_map(|line| {
                let rest = line.trim().strip_prefix("Test loss ")?;
                let loss: f64 = rest.trim_end_matches('.').split(',').next()?.trim().parse().ok()?;
                Some((loss, perplexity(loss)))
            })
        })
        .ok_or_else(|| MlError::evaluation("no test loss in framework output"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::example::Example;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Answers from a fixed prompt → answer table.
    struct Lookup(HashMap<String, String>);

    #[async_trait]
    impl Generator for Lookup {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, MlError> {
            Ok(self.0.get(&request.prompt).cloned().unwrap_or_default())
        }
    }

    fn lookup(pairs: &[(&str, &str)]) -> Lookup {
        Lookup(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_case_from_records() {
        let chat = Record::Chat(Example::new("sys", "question", "answer"));
        assert_eq!(
            EvalCase::from_record(&chat).unwrap(),
            EvalCase {
                system: Some("sys".into()),
                prompt: "question".into(),
                reference: "answer".into(),
            }
        );

        let blank_system = Record::Chat(Example::new("", "q", "a"));
        assert_eq!(EvalCase::from_record(&blank_system).unwrap().system, None);

        let completion = Record::Completion {
            prompt: "p".into(),
            completion: "c".into(),
        };
        assert_eq!(EvalCase::from_record(&completion).unwrap().reference, "c");
        assert!(EvalCase::from_record(&Record::Text { text: "t".into() }).is_none());
    }

    #[tokio::test]
    async fn test_evaluate_records() {
        let generator = lookup(&[("water", "vela"), ("sun", "taka")]);
        let records = vec![
            Record::Chat(Example::new("", "water", "vela")),
            Record::Chat(Example::new("", "sun", "suun")),
            Record::Text { text: "ignored".into() },
        ];

        let mut calls = Vec::new();
        let report = Evaluator::new(&generator)
            .evaluate_records(&records, |done, total| calls.push((done, total)))
            .await
            .unwrap();

        assert_eq!(calls, vec![(1, 2), (2, 2)]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.metrics.exact_match_rate, 0.5);
        assert_eq!(report.results[0].metrics.exact_match, 1.0);
        assert_eq!(report.results[1].prediction, "taka");
    }

    /// Upper-cases prompts and records the size of every batch.
    #[derive(Default)]
    struct Batching {
        sizes: Mutex<Vec<usize>>,
        drop_last: bool,
    }

    #[async_trait]
    impl Generator for Batching {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, MlError> {
            Ok(request.prompt.to_uppercase())
        }

        async fn generate_batch(
            &self,
            requests: &[GenerationRequest],
        ) -> Result<Vec<String>, MlError> {
            self.sizes.lock().unwrap().push(requests.len());
            let mut outputs: Vec<String> =
                requests.iter().map(|r| r.prompt.to_uppercase()).collect();
            if self.drop_last {
                outputs.pop();
            }
            Ok(outputs)
        }
    }

    fn numbered(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::Completion {
                prompt: format!("word{i}"),
                completion: format!("WORD{i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_evaluate_in_batches() {
        let generator = Batching::default();
        let mut calls = Vec::new();
        let report = Evaluator::new(&generator)
            .with_batch_size(2)
            .evaluate_records(&numbered(5), |done, _| calls.push(done))
            .await
            .unwrap();

        assert_eq!(*generator.sizes.lock().unwrap(), vec![2, 2, 1]);
        assert_eq!(calls, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.metrics.exact_match_rate, 1.0);
        let indices: Vec<usize> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.results[4].prediction, "WORD4");
    }

    #[tokio::test]
    async fn test_default_batch_loops_generate() {
        let generator = lookup(&[("water", "vela"), ("sun", "taka")]);
        let requests = [GenerationRequest::new("sun"), GenerationRequest::new("water")];
        assert_eq!(
            generator.generate_batch(&requests).await.unwrap(),
            vec!["taka", "vela"]
        );
    }

    #[tokio::test]
    async fn test_short_batch_is_an_error() {
        let generator = Batching {
            drop_last: true,
            ..Default::default()
        };
        let err = Evaluator::new(&generator)
            .with_batch_size(0)
            .evaluate_records(&numbered(2), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Evaluation(_)));
        assert_eq!(*generator.sizes.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_evaluate_requires_cases() {
        let generator = lookup(&[]);
        let err = Evaluator::new(&generator)
            .evaluate_records(&[Record::Text { text: "x".into() }], |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Evaluation(_)));

        let missing = Evaluator::new(&generator)
            .evaluate_file(Path::new("/nonexistent/test.jsonl"), |_, _| {})
            .await;
        assert!(matches!(missing, Err(MlError::NotFound(_))));
    }

    #[test]
    fn test_report_saves_metrics_and_results() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results/evaluation.json");
        let report = EvaluationReport {
            metrics: BatchScores::default(),
            skipped: 0,
            results: vec![],
        };
        report.save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value["metrics"].is_object());
        assert!(value["results"].is_array());
    }

    #[test]
    fn test_parse_test_report() {
        let out = "Loading pretrained model\nTesting\nTest loss 1.386, Test ppl 4.000.\n";
        let (loss, ppl) = parse_test_report(out).unwrap();
        assert_eq!(loss, 1.386);
        assert_eq!(ppl, 4.0);

        let (loss, ppl) = parse_test_report("Test loss 0.000.").unwrap();
        assert_eq!(loss, 0.0);
        assert_eq!(ppl, 1.0);

        assert!(parse_test_report("nothing here").is_err());
    }

    #[test]
    fn test_loss_probe_data_dir() {
        let tmp = TempDir::new().unwrap();
        let named = tmp.path().join("test.jsonl");
        std::fs::write(&named, "{}\n").unwrap();
        assert_eq!(
            LossProbe::data_dir(&named, &tmp.path().join("stage")).unwrap(),
            tmp.path()
        );

        let other = tmp.path().join("holdout.jsonl");
        std::fs::write(&other, "{}\n").unwrap();
        let stage = tmp.path().join("stage");
        assert_eq!(LossProbe::data_dir(&other, &stage).unwrap(), stage);
        assert!(stage.join("test.jsonl").is_file());
    }

    #[test]
    fn test_loss_probe_args() {
        let probe = LossProbe::new(
            PythonRuntime::new(PathBuf::from(".")),
            ModelLocation {
                model: "models/base".into(),
                adapter: Some(PathBuf::from("adapters")),
            },
        );
        assert_eq!(
            probe.args(Path::new("data/processed")),
            vec![
                "--model",
                "models/base",
                "--data",
                "data/processed",
                "--test",
                "--adapter-path",
                "adapters"
            ]
        );
    }
}
