//! Conversion of chat examples into the configured record format.

use crate::data::example::{Example, Record};
use crate::error::MlError;
use hirnu_core::persistence;
use hirnu_core::RecordFormat;
use std::path::Path;
use tracing::info;

/// Wraps examples into chat, completion or text records.
#[derive(Debug, Clone, Copy)]
pub struct FormatConverter {
    format: RecordFormat,
}

impl FormatConverter {
    pub fn new(format: RecordFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn convert(&self, example: &Example) -> Record {
        match self.format {
            RecordFormat::Chat => Record::Chat(example.clone()),
            RecordFormat::Completion => {
                let users: Vec<&str> = example.user_turns().collect();
                let mut prompt = users.join("\n");
                if let Some(system) = example.system().filter(|s| !s.is_empty()) {
                    prompt = format!("{system}\n\n{prompt}");
                }
                Record::Completion {
                    prompt,
                    completion: example.last_assistant().unwrap_or_default().to_string(),
                }
            }
            RecordFormat::Text => {
                let text = example
                    .messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                Record::Text { text }
            }
        }
    }

    /// Write one JSON record per line to `path`. Returns the number of lines.
    pub fn write_jsonl(&self, examples: &[Example], path: &Path) -> Result<usize, MlError> {
        let mut output = String::new();
        for example in examples {
            output.push_str(&serde_json::to_string(&self.convert(example))?);
            output.push('\n');
        }
        persistence::atomic_write(path, output.as_bytes())?;
        info!(path = %path.display(), count = examples.len(), format = %self.format, "Saved examples");
        Ok(examples.len())
    }
}
