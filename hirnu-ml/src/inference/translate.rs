//! English ↔ Hirnu translation on top of a [`Generator`].

use crate::data::preprocess::PairKind;
use crate::error::MlError;
use crate::inference::generate::{GenerationRequest, Generator};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Hirnu,
}

impl Language {
    pub fn name(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Hirnu => "Hirnu",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Language::English => Language::Hirnu,
            Language::Hirnu => Language::English,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Language::English),
            "hi" | "hirnu" => Ok(Language::Hirnu),
            other => Err(MlError::invalid_input(format!(
                "unknown language '{other}' (expected english or hirnu)"
            ))),
        }
    }
}

/// Builds translation prompts in the same wording the training data uses.
pub struct Translator<'a> {
    generator: &'a dyn Generator,
    system: Option<String>,
    max_tokens: usize,
    temperature: f64,
}

impl<'a> Translator<'a> {
    pub fn new(generator: &'a dyn Generator) -> Self {
        let defaults = GenerationRequest::new("");
        Self {
            generator,
            system: None,
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn with_sampling(mut self, max_tokens: usize, temperature: f64) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn prompt(text: &str, source: Language, target: Language) -> Result<String, MlError> {
        let kind = match (source, target) {
            (Language::English, Language::Hirnu) => PairKind::EnglishToHirnu,
            (Language::Hirnu, Language::English) => PairKind::HirnuToEnglish,
            _ => {
                return Err(MlError::invalid_input(format!(
                    "source and target language are both {source}"
                )));
            }
        };
        Ok(kind.prompt(text.trim()))
    }

    pub fn request(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> Result<GenerationRequest, MlError> {
        Ok(GenerationRequest::new(Self::prompt(text, source, target)?)
            .with_system(self.system.clone())
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature))
    }

    pub async fn translate(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> Result<String, MlError> {
        if text.trim().is_empty() {
            return Err(MlError::invalid_input("nothing to translate"));
        }
        let request = self.request(text, source, target)?;
        self.generator.generate(&request).await
    }
}
