//! Parsing of `mlx_lm.lora` report lines.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

static TRAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Iter (\d+): Train loss ([^,\s]+)").unwrap());
static VAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Iter (\d+): Val loss ([^,\s]+)").unwrap());
static SAVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Iter (\d+): Saved adapter weights to (.*?adapters\.safetensors) and (.+\d+_adapters\.safetensors)\.?$",
    )
    .unwrap()
});
static FINAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Saved final weights to (.+?)\.?$").unwrap());
static TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Test loss ([^,\s]+), Test ppl ([^,\s]+?)\.?$").unwrap());

static LR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Learning Rate ([^,\s]+)").unwrap());
static TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tokens/sec ([^,\s]+)").unwrap());
static PEAK_MEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Peak mem ([^,\s]+) GB").unwrap());

/// Something the framework reported.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainerEvent {
    TrainReport {
        iteration: usize,
        loss: f64,
        learning_rate: Option<f64>,
        tokens_per_sec: Option<f64>,
        peak_memory_gb: Option<f64>,
    },
    ValReport {
        iteration: usize,
        loss: f64,
    },
    /// A periodic adapter save; `path` is the iteration-numbered copy.
    AdapterSaved {
        iteration: usize,
        path: PathBuf,
    },
    FinalSaved {
        path: PathBuf,
    },
    TestReport {
        loss: f64,
        perplexity: f64,
    },
}

impl TrainerEvent {
    /// Iteration the event belongs to, when it has one.
    pub fn iteration(&self) -> Option<usize> {
        match self {
            TrainerEvent::TrainReport { iteration, .. }
            | TrainerEvent::ValReport { iteration, .. }
            | TrainerEvent::AdapterSaved { iteration, .. } => Some(*iteration),
            _ => None,
        }
    }
}

/// Parse one output line. Unrecognised lines yield `None`.
pub fn parse_line(line: &str) -> Option<TrainerEvent> {
    let line = line.trim();

    if let Some(caps) = TRAIN_RE.captures(line) {
        return Some(TrainerEvent::TrainReport {
            iteration: caps[1].parse().ok()?,
            loss: caps[2].parse().ok()?,
            learning_rate: capture_f64(&LR_RE, line),
            tokens_per_sec: capture_f64(&TOKENS_RE, line),
            peak_memory_gb: capture_f64(&PEAK_MEM_RE, line),
        });
    }
    if let Some(caps) = VAL_RE.captures(line) {
        return Some(TrainerEvent::ValReport {
            iteration: caps[1].parse().ok()?,
            loss: caps[2].parse().ok()?,
        });
    }
    if let Some(caps) = SAVED_RE.captures(line) {
        return Some(TrainerEvent::AdapterSaved {
            iteration: caps[1].parse().ok()?,
            path: PathBuf::from(&caps[3]),
        });
    }
    if let Some(caps) = FINAL_RE.captures(line) {
        return Some(TrainerEvent::FinalSaved {
            path: PathBuf::from(&caps[1]),
        });
    }
    if let Some(caps) = TEST_RE.captures(line) {
        return Some(TrainerEvent::TestReport {
            loss: caps[1].parse().ok()?,
            perplexity: caps[2].parse().ok()?,
        });
    }
    None
}

fn capture_f64(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)?.get(1)?.as_str().parse().ok()
}
