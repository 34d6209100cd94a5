//! Schema checking of JSONL dataset files.
//!
//! Diagnostic only: lines are counted and reported, never repaired. A bad
//! line never stops validation of the lines after it.

use hirnu_core::RecordFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Error messages kept per file report.
pub const MAX_REPORTED_ERRORS: usize = 10;

const ROLES: [&str; 3] = ["system", "user", "assistant"];

/// Per-file validation result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub file: PathBuf,
    pub valid: bool,
    pub total: usize,
    pub valid_examples: usize,
    pub invalid_examples: usize,
    /// First [`MAX_REPORTED_ERRORS`] messages, `Line N: ...`.
    pub errors: Vec<String>,
}

impl FileReport {
    fn missing(path: &Path) -> Self {
        Self {
            file: path.to_path_buf(),
            valid: false,
            errors: vec![format!("File not found: {}", path.display())],
            ..Self::default()
        }
    }

    fn record(&mut self, lineno: usize, result: Result<(), String>) {
        self.total += 1;
        match result {
            Ok(()) => self.valid_examples += 1,
            Err(e) => {
                self.invalid_examples += 1;
                if self.errors.len() < MAX_REPORTED_ERRORS {
                    self.errors.push(format!("Line {lineno}: {e}"));
                }
            }
        }
    }
}

/// Reports for the three split files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitsReport {
    pub all_valid: bool,
    pub train: FileReport,
    pub test: FileReport,
    pub valid: FileReport,
}

impl fmt::Display for FileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.valid { "VALID" } else { "INVALID" };
        writeln!(f, "{}: {status}", self.file.display())?;
        writeln!(f, "  Total examples: {}", self.total)?;
        writeln!(f, "  Valid: {}", self.valid_examples)?;
        writeln!(f, "  Invalid: {}", self.invalid_examples)?;
        if !self.errors.is_empty() {
            writeln!(f, "  Errors (showing first {MAX_REPORTED_ERRORS}):")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for SplitsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Validation Report")?;
        writeln!(f, "{}", "=".repeat(60))?;
        for (name, report) in [
            ("TRAIN", &self.train),
            ("TEST", &self.test),
            ("VALID", &self.valid),
        ] {
            writeln!(f)?;
            write!(f, "[{name}] {report}")?;
        }
        writeln!(f)?;
        writeln!(f, "{}", "=".repeat(60))?;
        if self.all_valid {
            write!(f, "All datasets are valid")
        } else {
            write!(f, "Some datasets have validation errors")
        }
    }
}

/// Checks records against one of the three layouts.
#[derive(Debug, Clone, Copy)]
pub struct DatasetValidator {
    format: RecordFormat,
}

impl DatasetValidator {
    pub fn new(format: RecordFormat) -> Self {
        Self { format }
    }

    /// Check one decoded record.
    pub fn validate_value(&self, value: &Value) -> Result<(), String> {
        match self.format {
            RecordFormat::Chat => validate_chat(value),
            RecordFormat::Completion => {
                for key in ["prompt", "completion"] {
                    if value.get(key).is_none() {
                        return Err(format!("Missing '{key}' field"));
                    }
                }
                Ok(())
            }
            RecordFormat::Text => match value.get("text") {
                None => Err("Missing 'text' field".to_string()),
                Some(Value::String(_)) => Ok(()),
                Some(_) => Err("'text' must be a string".to_string()),
            },
        }
    }

    /// Decode and check one line.
    pub fn validate_line(&self, line: &str) -> Result<(), String> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("Invalid JSON - {e}"))?;
        self.validate_value(&value)
    }

    /// Validate every non-blank line from `reader`.
    pub fn validate_reader<R: Read>(&self, reader: R, file: &Path) -> FileReport {
        let mut report = FileReport {
            file: file.to_path_buf(),
            ..FileReport::default()
        };

        for (idx, chunk) in BufReader::new(reader).split(b'\n').enumerate() {
            let lineno = idx + 1;
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Read failed mid-file");
                    report.record(lineno, Err(format!("Read error - {e}")));
                    break;
                }
            };
            let line = match std::str::from_utf8(&bytes) {
                Ok(line) => line,
                Err(e) => {
                    report.record(lineno, Err(format!("Invalid UTF-8 - {e}")));
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            report.record(lineno, self.validate_line(line));
        }

        report.valid = report.invalid_examples == 0;
        debug!(
            file = %file.display(),
            total = report.total,
            invalid = report.invalid_examples,
            "Validated file"
        );
        report
    }

    pub fn validate_file(&self, path: &Path) -> FileReport {
        match std::fs::File::open(path) {
            Ok(file) => self.validate_reader(file, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileReport::missing(path),
            Err(e) => FileReport {
                file: path.to_path_buf(),
                valid: false,
                errors: vec![format!("Cannot open file: {e}")],
                ..FileReport::default()
            },
        }
    }

    pub fn validate_splits(&self, train: &Path, test: &Path, valid: &Path) -> SplitsReport {
        let train = self.validate_file(train);
        let test = self.validate_file(test);
        let valid = self.validate_file(valid);
        SplitsReport {
            all_valid: train.valid && test.valid && valid.valid,
            train,
            test,
            valid,
        }
    }
}

fn validate_chat(value: &Value) -> Result<(), String> {
    let messages = value
        .get("messages")
        .ok_or_else(|| "Missing 'messages' field".to_string())?
        .as_array()
        .ok_or_else(|| "'messages' must be a list".to_string())?;

    for (i, msg) in messages.iter().enumerate() {
        let msg = msg
            .as_object()
            .ok_or_else(|| format!("Message {i} is not an object"))?;
        let role = msg
            .get("role")
            .ok_or_else(|| format!("Message {i} missing 'role' field"))?;
        let content = msg
            .get("content")
            .ok_or_else(|| format!("Message {i} missing 'content' field"))?;
        if !role.as_str().is_some_and(|r| ROLES.contains(&r)) {
            return Err(format!("Message {i} has invalid role: {role}"));
        }
        if !content.is_string() {
            return Err(format!("Message {i} content must be a string"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn chat() -> DatasetValidator {
        DatasetValidator::new(RecordFormat::Chat)
    }

    #[test]
    fn test_chat_rules() {
        let v = chat();
        assert!(
            v.validate_line(r#"{"messages":[{"role":"user","content":"hi"}]}"#)
                .is_ok()
        );
        assert_eq!(
            v.validate_line(r#"{"text":"x"}"#).unwrap_err(),
            "Missing 'messages' field"
        );
        assert_eq!(
            v.validate_line(r#"{"messages":{}}"#).unwrap_err(),
            "'messages' must be a list"
        );
        assert_eq!(
            v.validate_line(r#"{"messages":["x"]}"#).unwrap_err(),
            "Message 0 is not an object"
        );
        assert_eq!(
            v.validate_line(r#"{"messages":[{"content":"x"}]}"#)
                .unwrap_err(),
            "Message 0 missing 'role' field"
        );
        assert_eq!(
            v.validate_line(r#"{"messages":[{"role":"user","content":"a"},{"role":"tool","content":"b"}]}"#)
                .unwrap_err(),
            "Message 1 has invalid role: \"tool\""
        );
        assert!(
            v.validate_line(r#"{"messages":[{"role":"user","content":5}]}"#)
                .is_err()
        );
    }

    #[test]
    fn test_completion_and_text_rules() {
        let completion = DatasetValidator::new(RecordFormat::Completion);
        assert!(completion.validate_line(r#"{"prompt":"p","completion":"c"}"#).is_ok());
        assert_eq!(
            completion.validate_line(r#"{"prompt":"p"}"#).unwrap_err(),
            "Missing 'completion' field"
        );

        let text = DatasetValidator::new(RecordFormat::Text);
        assert!(text.validate_line(r#"{"text":"t"}"#).is_ok());
        assert_eq!(
            text.validate_line(r#"{"text":3}"#).unwrap_err(),
            "'text' must be a string"
        );
    }

    #[test]
    fn test_bad_line_does_not_abort() {
        let input = "{\"text\":\"a\"}\nnot json\n\n{\"text\":\"b\"}\n";
        let report = DatasetValidator::new(RecordFormat::Text)
            .validate_reader(Cursor::new(input), Path::new("mem.jsonl"));
        assert_eq!(report.total, 3);
        assert_eq!(report.valid_examples, 2);
        assert_eq!(report.invalid_examples, 1);
        assert!(!report.valid);
        assert!(report.errors[0].starts_with("Line 2: Invalid JSON"));
    }

    #[test]
    fn test_invalid_utf8_line_counted() {
        let mut input = b"{\"text\":\"a\"}\n".to_vec();
        input.extend_from_slice(&[0xff, 0xfe, b'\n']);
        let report = DatasetValidator::new(RecordFormat::Text)
            .validate_reader(Cursor::new(input), Path::new("mem.jsonl"));
        assert_eq!(report.total, 2);
        assert_eq!(report.invalid_examples, 1);
        assert!(report.errors[0].contains("Invalid UTF-8"));
    }

    #[test]
    fn test_error_list_is_capped() {
        let input = "x\n".repeat(25);
        let report = chat().validate_reader(Cursor::new(input), Path::new("mem.jsonl"));
        assert_eq!(report.invalid_examples, 25);
        assert_eq!(report.errors.len(), MAX_REPORTED_ERRORS);
    }

    #[test]
    fn test_missing_file() {
        let report = chat().validate_file(Path::new("/nonexistent/train.jsonl"));
        assert!(!report.valid);
        assert_eq!(report.total, 0);
        assert!(report.errors[0].contains("File not found"));
    }

    #[test]
    fn test_splits_report_display() {
        let dir = tempfile::tempdir().unwrap();
        let line = "{\"messages\":[{\"role\":\"user\",\"content\":\"hi\"}]}\n";
        for name in ["train", "test", "valid"] {
            std::fs::write(dir.path().join(format!("{name}.jsonl")), line).unwrap();
        }
        let report = chat().validate_splits(
            &dir.path().join("train.jsonl"),
            &dir.path().join("test.jsonl"),
            &dir.path().join("valid.jsonl"),
        );
        assert!(report.all_valid);
        let rendered = report.to_string();
        assert!(rendered.contains("[TRAIN]"));
        assert!(rendered.ends_with("All datasets are valid"));
    }
}
