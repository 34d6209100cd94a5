//! Raw corpus parsing.
//!
//! Source files are line-oriented and tagged:
//!
//! ```text
//! # grammar drill
//! Q: How is the plural formed?
//! A: By adding -ir to the stem.
//!    Irregular nouns keep their stem vowel.
//!
//! EN: water
//! HI: suun
//! ```
//!
//! The first tag of a record picks its kind (`Q` grammar, `EN` English to
//! Hirnu, `HI` Hirnu to English) and the expected follower tag. Untagged lines
//! continue the previous field, blank lines close the record, `#` lines are
//! comments. A completed pair immediately followed by a new leader closes
//! without a blank line.

use crate::data::example::Example;
use crate::error::MlError;
use hirnu_core::config::{DataConfig, DataSources, PreprocessingConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(Q|A|EN|HI)\s*:\s?(.*)$").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Line tag recognised by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Q,
    A,
    En,
    Hi,
}

impl Tag {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Q" => Some(Tag::Q),
            "A" => Some(Tag::A),
            "EN" => Some(Tag::En),
            "HI" => Some(Tag::Hi),
            _ => None,
        }
    }

    /// The pair kind this tag opens, if it can lead a record.
    fn leads(self) -> Option<PairKind> {
        match self {
            Tag::Q => Some(PairKind::GrammarQa),
            Tag::En => Some(PairKind::EnglishToHirnu),
            Tag::Hi => Some(PairKind::HirnuToEnglish),
            Tag::A => None,
        }
    }
}

/// Kind of training pair, decided by the leading tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairKind {
    GrammarQa,
    EnglishToHirnu,
    HirnuToEnglish,
}

impl PairKind {
    /// Tag that must close a record of this kind.
    pub fn follower(self) -> Tag {
        match self {
            PairKind::GrammarQa => Tag::A,
            PairKind::EnglishToHirnu => Tag::Hi,
            PairKind::HirnuToEnglish => Tag::En,
        }
    }

    /// User turn for a pair of this kind.
    pub fn prompt(self, source: &str) -> String {
        match self {
            PairKind::GrammarQa => source.to_string(),
            PairKind::EnglishToHirnu => {
                format!("Translate the following English text to Hirnu: {source}")
            }
            PairKind::HirnuToEnglish => {
                format!("Translate the following Hirnu text to English: {source}")
            }
        }
    }
}

/// A parsed leader/follower pair before cleaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPair {
    pub kind: PairKind,
    pub source: String,
    pub target: String,
    /// Line of the leading tag (1-based).
    pub line: usize,
}

/// A record that could not be turned into a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Malformed {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub pairs: Vec<RawPair>,
    pub malformed: Vec<Malformed>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Source,
    Target,
}

struct Pending {
    kind: PairKind,
    line: usize,
    source: String,
    target: Option<String>,
    last: Field,
}

impl Pending {
    fn open(kind: PairKind, line: usize, text: &str) -> Self {
        Self {
            kind,
            line,
            source: text.to_string(),
            target: None,
            last: Field::Source,
        }
    }

    fn continue_with(&mut self, text: &str) {
        let field = match (self.last, self.target.as_mut()) {
            (Field::Target, Some(target)) => target,
            _ => &mut self.source,
        };
        if !field.is_empty() {
            field.push('\n');
        }
        field.push_str(text);
    }

    fn close(self, out: &mut ParseOutcome) {
        match self.target {
            None => out.malformed.push(Malformed {
                line: self.line,
                reason: format!("expected {:?} after this line", self.kind.follower()),
            }),
            Some(target) if self.source.trim().is_empty() || target.trim().is_empty() => {
                out.malformed.push(Malformed {
                    line: self.line,
                    reason: "pair has an empty field".to_string(),
                })
            }
            Some(target) => out.pairs.push(RawPair {
                kind: self.kind,
                source: self.source,
                target,
                line: self.line,
            }),
        }
    }
}

/// Parse tagged text into raw pairs, collecting malformed records.
pub fn parse_tagged_pairs(text: &str) -> ParseOutcome {
    let mut out = ParseOutcome::default();
    let mut pending: Option<Pending> = None;

    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            if let Some(p) = pending.take() {
                p.close(&mut out);
            }
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }

        let tagged = TAG_RE
            .captures(line)
            .and_then(|caps| Some((Tag::parse(caps.get(1)?.as_str())?, caps.get(2)?.as_str())));

        let Some((tag, body)) = tagged else {
            match pending.as_mut() {
                Some(p) => p.continue_with(trimmed),
                None => out.malformed.push(Malformed {
                    line: lineno,
                    reason: "text outside a tagged record".to_string(),
                }),
            }
            continue;
        };
        let body = body.trim();

        // A waiting leader accepts only its follower.
        if let Some(p) = pending.as_mut() {
            if p.target.is_none() {
                if tag == p.kind.follower() {
                    p.target = Some(body.to_string());
                    p.last = Field::Target;
                    continue;
                }
                out.malformed.push(Malformed {
                    line: p.line,
                    reason: format!(
                        "expected {:?} but found {:?} on line {lineno}",
                        p.kind.follower(),
                        tag
                    ),
                });
                pending = None;
            }
        }

        if let Some(p) = pending.take() {
            p.close(&mut out);
        }

        match tag.leads() {
            Some(kind) => pending = Some(Pending::open(kind, lineno, body)),
            None => out.malformed.push(Malformed {
                line: lineno,
                reason: format!("{tag:?} without a preceding Q"),
            }),
        }
    }

    if let Some(p) = pending.take() {
        p.close(&mut out);
    }
    out
}

/// Counters for one preprocessing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessStats {
    pub files_read: usize,
    pub files_skipped: usize,
    pub pairs_parsed: usize,
    pub malformed: usize,
    pub length_filtered: usize,
}

/// Examples plus the statistics of the run that produced them.
#[derive(Debug, Clone, Default)]
pub struct PreprocessOutput {
    pub examples: Vec<Example>,
    pub stats: PreprocessStats,
}

/// Turns tagged source files into chat examples.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    options: PreprocessingConfig,
    system_prompt: String,
}

impl Preprocessor {
    pub fn new(options: PreprocessingConfig, system_prompt: impl Into<String>) -> Self {
        Self {
            options,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn from_config(config: &DataConfig) -> Self {
        Self::new(
            config.preprocessing.clone(),
            config.format.chat_template.system.clone(),
        )
    }

    /// Collapse whitespace runs to a single space and trim, when enabled.
    pub fn normalize(&self, text: &str) -> String {
        if !self.options.normalize_whitespace {
            return text.to_string();
        }
        WHITESPACE_RE.replace_all(text, " ").trim().to_string()
    }

    /// Whether the combined source and target length is in range.
    pub fn within_length(&self, source: &str, target: &str) -> bool {
        let len = source.chars().count() + target.chars().count();
        (self.options.min_text_length..=self.options.max_text_length).contains(&len)
    }

    /// Parse one document. `origin` names it in log messages.
    pub fn process_text(
        &self,
        text: &str,
        origin: &str,
        stats: &mut PreprocessStats,
    ) -> Vec<Example> {
        let outcome = parse_tagged_pairs(text);

        for bad in &outcome.malformed {
            warn!(file = origin, line = bad.line, reason = %bad.reason, "Skipping malformed pair");
        }
        stats.malformed += outcome.malformed.len();

        let mut examples = Vec::with_capacity(outcome.pairs.len());
        for pair in outcome.pairs {
            stats.pairs_parsed += 1;
            let source = self.normalize(&pair.source);
            let target = self.normalize(&pair.target);
            if !self.within_length(&source, &target) {
                debug!(file = origin, line = pair.line, "Pair outside length range");
                stats.length_filtered += 1;
                continue;
            }
            examples.push(Example::new(
                self.system_prompt.clone(),
                pair.kind.prompt(&source),
                target,
            ));
        }
        examples
    }

    /// Read and parse a single file.
    pub fn process_file(
        &self,
        path: &Path,
        stats: &mut PreprocessStats,
    ) -> Result<Vec<Example>, MlError> {
        let text = std::fs::read_to_string(path)?;
        stats.files_read += 1;
        Ok(self.process_text(&text, &path.display().to_string(), stats))
    }

    /// Parse every `*.txt` file under `dir` in sorted path order. Unreadable
    /// files are logged and skipped.
    pub fn process_dir(&self, dir: &Path, stats: &mut PreprocessStats) -> Vec<Example> {
        let mut examples = Vec::new();
        for path in text_files(dir) {
            match self.process_file(&path, stats) {
                Ok(mut found) => {
                    debug!(file = %path.display(), examples = found.len(), "Processed file");
                    examples.append(&mut found);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable file");
                    stats.files_skipped += 1;
                }
            }
        }
        examples
    }

    /// Process the grammar, vocabulary and texts directories in that order.
    pub fn process_sources(&self, sources: &DataSources) -> PreprocessOutput {
        let mut output = PreprocessOutput::default();
        for dir in sources.dirs() {
            if !dir.is_dir() {
                info!(dir = %dir.display(), "Source directory not found, skipping");
                continue;
            }
            let mut found = self.process_dir(dir, &mut output.stats);
            info!(dir = %dir.display(), examples = found.len(), "Processed source directory");
            output.examples.append(&mut found);
        }
        output
    }
}

fn text_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to walk directory entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::example::Role;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(PreprocessingConfig::default(), "You are a Hirnu tutor.")
    }

    #[test]
    fn test_parse_all_pair_kinds() {
        let text = "Q: How is the plural formed?\nA: By adding -ir.\n\nEN: water\nHI: suun\n\nHI: suun taka\nEN: the water flows\n";
        let outcome = parse_tagged_pairs(text);
        assert!(outcome.malformed.is_empty());
        let kinds: Vec<PairKind> = outcome.pairs.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PairKind::GrammarQa,
                PairKind::EnglishToHirnu,
                PairKind::HirnuToEnglish
            ]
        );
        assert_eq!(outcome.pairs[1].source, "water");
        assert_eq!(outcome.pairs[1].target, "suun");
        assert_eq!(outcome.pairs[2].line, 7);
    }

    #[test]
    fn test_continuation_lines_join_previous_field() {
        let text = "Q: Explain the\n   genitive case.\nA: It marks possession.\n   It follows the noun.\n";
        let outcome = parse_tagged_pairs(text);
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].source, "Explain the\ngenitive case.");
        assert_eq!(
            outcome.pairs[0].target,
            "It marks possession.\nIt follows the noun."
        );
    }

    #[test]
    fn test_consecutive_pairs_without_blank_line() {
        let text = "EN: one\nHI: ka\nEN: two\nHI: ro\n";
        let outcome = parse_tagged_pairs(text);
        assert_eq!(outcome.pairs.len(), 2);
        assert_eq!(outcome.pairs[1].target, "ro");
    }

    #[test]
    fn test_malformed_pairs_are_reported() {
        let text = "Q: dangling question\n\nA: orphan answer\n\nEN: mismatch\nQ: new question\nA: answer\n\nstray text\n";
        let outcome = parse_tagged_pairs(text);
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].source, "new question");
        let lines: Vec<usize> = outcome.malformed.iter().map(|m| m.line).collect();
        assert_eq!(lines, vec![1, 3, 5, 9]);
    }

    #[test]
    fn test_comments_and_tag_whitespace() {
        let text = "# header\n  EN :  hello  \n# inline comment\nHI:salo\n";
        let outcome = parse_tagged_pairs(text);
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].source, "hello");
        assert_eq!(outcome.pairs[0].target, "salo");
    }

    #[test]
    fn test_lowercase_tags_are_plain_text() {
        let outcome = parse_tagged_pairs("en: hello\nhi: salo\n");
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.malformed.len(), 2);
    }

    #[test]
    fn test_normalize_whitespace() {
        let p = preprocessor();
        assert_eq!(p.normalize("  a \t b\n\nc  "), "a b c");

        let raw = Preprocessor::new(
            PreprocessingConfig {
                normalize_whitespace: false,
                ..PreprocessingConfig::default()
            },
            "",
        );
        assert_eq!(raw.normalize("  a \t b "), "  a \t b ");
    }

    #[test]
    fn test_length_filter_is_inclusive() {
        let p = Preprocessor::new(
            PreprocessingConfig {
                normalize_whitespace: true,
                min_text_length: 4,
                max_text_length: 6,
            },
            "",
        );
        assert!(!p.within_length("a", "bc"));
        assert!(p.within_length("ab", "cd"));
        assert!(p.within_length("abc", "def"));
        assert!(!p.within_length("abcd", "efg"));
    }

    #[test]
    fn test_process_text_builds_examples() {
        let p = preprocessor();
        let mut stats = PreprocessStats::default();
        let examples = p.process_text(
            "EN: the river is wide\nHI: suun-taka vela\n\nEN: hi\nHI: sa\n",
            "vocab.txt",
            &mut stats,
        );
        assert_eq!(examples.len(), 1);
        assert_eq!(stats.pairs_parsed, 2);
        assert_eq!(stats.length_filtered, 1);

        let messages = &examples[0].messages;
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "You are a Hirnu tutor.");
        assert_eq!(
            messages[1].content,
            "Translate the following English text to Hirnu: the river is wide"
        );
        assert_eq!(messages[2].content, "suun-taka vela");
    }

    #[test]
    fn test_process_sources_sorted_and_skips_bad_files() {
        let dir = TempDir::new().unwrap();
        let sources = DataSources {
            grammar: dir.path().join("grammar"),
            vocabulary: dir.path().join("vocabulary"),
            texts: dir.path().join("missing"),
        };
        std::fs::create_dir_all(&sources.grammar).unwrap();
        std::fs::create_dir_all(&sources.vocabulary).unwrap();
        std::fs::write(
            sources.grammar.join("b.txt"),
            "Q: Second grammar question?\nA: Second answer here.\n",
        )
        .unwrap();
        std::fs::write(
            sources.grammar.join("a.txt"),
            "Q: First grammar question?\nA: First answer here.\n",
        )
        .unwrap();
        std::fs::write(sources.grammar.join("notes.md"), "Q: ignored?\nA: yes\n").unwrap();
        std::fs::write(sources.vocabulary.join("bad.txt"), [0xff, 0xfe, 0x00]).unwrap();

        let output = preprocessor().process_sources(&sources);
        assert_eq!(output.examples.len(), 2);
        assert_eq!(
            output.examples[0].messages[1].content,
            "First grammar question?"
        );
        assert_eq!(output.stats.files_read, 2);
        assert_eq!(output.stats.files_skipped, 1);
    }
}
