//! Text-generation metrics.
//!
//! Corpus-level functions take parallel prediction/reference slices; a length
//! mismatch is an [`MlError::InvalidInput`].

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default maximum n-gram order for BLEU.
pub const BLEU_MAX_N: usize = 4;

pub fn perplexity(loss: f64) -> f64 {
    loss.exp()
}

fn check_lengths(predictions: &[String], references: &[String]) -> Result<(), MlError> {
    if predictions.len() != references.len() {
        return Err(MlError::invalid_input(format!(
            "predictions ({}) and references ({}) must have the same length",
            predictions.len(),
            references.len()
        )));
    }
    Ok(())
}

fn ngram_counts<'t, 's>(tokens: &'t [&'s str], n: usize) -> HashMap<&'t [&'s str], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

/// Corpus BLEU on whitespace tokens, scaled to 0-100.
///
/// Orders for which no prediction has enough tokens are left out of the
/// geometric mean, so short but identical corpora still score 100. The score
/// is 0 when any remaining order has no matching n-gram.
pub fn corpus_bleu(
    predictions: &[String],
    references: &[String],
    max_n: usize,
) -> Result<f64, MlError> {
    check_lengths(predictions, references)?;
    let max_n = max_n.max(1);

    let mut matches = vec![0usize; max_n];
    let mut totals = vec![0usize; max_n];
    let mut pred_len = 0usize;
    let mut ref_len = 0usize;

    for (pred, reference) in predictions.iter().zip(references) {
        let pred_tokens: Vec<&str> = pred.split_whitespace().collect();
        let ref_tokens: Vec<&str> = reference.split_whitespace().collect();
        pred_len += pred_tokens.len();
        ref_len += ref_tokens.len();

        for n in 1..=max_n {
            let ref_counts = ngram_counts(&ref_tokens, n);
            for (gram, count) in ngram_counts(&pred_tokens, n) {
                let clip = ref_counts.get(gram).copied().unwrap_or(0);
                matches[n - 1] += count.min(clip);
                totals[n - 1] += count;
            }
        }
    }

    if pred_len == 0 {
        return Ok(0.0);
    }

    let mut log_sum = 0.0;
    let mut orders = 0usize;
    for (matched, total) in matches.iter().zip(&totals) {
        if *total == 0 {
            continue;
        }
        if *matched == 0 {
            return Ok(0.0);
        }
        log_sum += (*matched as f64 / *total as f64).ln();
        orders += 1;
    }

    let brevity_penalty = if pred_len > ref_len {
        1.0
    } else {
        (1.0 - ref_len as f64 / pred_len as f64).exp()
    };

    Ok(100.0 * brevity_penalty * (log_sum / orders as f64).exp())
}

/// Edit distance over `char`s.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Total edit distance divided by total reference characters.
pub fn character_error_rate(predictions: &[String], references: &[String]) -> Result<f64, MlError> {
    check_lengths(predictions, references)?;
    let mut errors = 0usize;
    let mut chars = 0usize;
    for (pred, reference) in predictions.iter().zip(references) {
        errors += levenshtein(pred, reference);
        chars += reference.chars().count();
    }
    Ok(match (chars, errors) {
        (0, 0) => 0.0,
        (0, _) => 1.0,
        _ => errors as f64 / chars as f64,
    })
}

/// Fraction of predictions equal to their reference after trimming.
pub fn exact_match_accuracy(predictions: &[String], references: &[String]) -> Result<f64, MlError> {
    check_lengths(predictions, references)?;
    if predictions.is_empty() {
        return Ok(0.0);
    }
    let hits = predictions
        .iter()
        .zip(references)
        .filter(|(p, r)| p.trim() == r.trim())
        .count();
    Ok(hits as f64 / predictions.len() as f64)
}

/// Position-wise word matches over total reference words.
pub fn word_accuracy(predictions: &[String], references: &[String]) -> Result<f64, MlError> {
    check_lengths(predictions, references)?;
    let mut correct = 0usize;
    let mut total = 0usize;
    for (pred, reference) in predictions.iter().zip(references) {
        let ref_words: Vec<&str> = reference.split_whitespace().collect();
        total += ref_words.len();
        correct += pred
            .split_whitespace()
            .zip(&ref_words)
            .filter(|(p, r)| p == *r)
            .count();
    }
    Ok(if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    })
}

/// Scores for one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TranslationScores {
    pub exact_match: f64,
    pub character_error_rate: f64,
    pub word_accuracy: f64,
}

impl TranslationScores {
    pub fn score(prediction: &str, reference: &str) -> Self {
        let pred = [prediction.to_string()];
        let refs = [reference.to_string()];
        // Single-element slices always have matching lengths.
        Self {
            exact_match: exact_match_accuracy(&pred, &refs).unwrap_or(0.0),
            character_error_rate: character_error_rate(&pred, &refs).unwrap_or(1.0),
            word_accuracy: word_accuracy(&pred, &refs).unwrap_or(0.0),
        }
    }
}

/// Aggregate scores over a set of predictions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchScores {
    pub total_examples: usize,
    pub exact_match_rate: f64,
    pub avg_character_error_rate: f64,
    pub avg_word_accuracy: f64,
    pub bleu: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_perplexity: Option<f64>,
}

impl BatchScores {
    pub fn evaluate(predictions: &[String], references: &[String]) -> Result<Self, MlError> {
        check_lengths(predictions, references)?;
        if predictions.is_empty() {
            return Ok(Self::default());
        }

        let per_example: Vec<TranslationScores> = predictions
            .iter()
            .zip(references)
            .map(|(p, r)| TranslationScores::score(p, r))
            .collect();
        let n = per_example.len() as f64;
        let mean = |f: fn(&TranslationScores) -> f64| per_example.iter().map(f).sum::<f64>() / n;

        Ok(Self {
            total_examples: per_example.len(),
            exact_match_rate: mean(|s| s.exact_match),
            avg_character_error_rate: mean(|s| s.character_error_rate),
            avg_word_accuracy: mean(|s| s.word_accuracy),
            bleu: corpus_bleu(predictions, references, BLEU_MAX_N)?,
            test_loss: None,
            test_perplexity: None,
        })
    }
}
