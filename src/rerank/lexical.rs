//! Lexical cross-encoder fallback.

use super::CrossEncoder;
use crate::Result;
use std::collections::{HashMap, HashSet};

/// Rescorer based on IDF-weighted query-term overlap.
///
/// No model required: document frequencies are computed over the passage
/// shortlist itself, so rare query terms dominate the score the way a
/// learned cross-encoder would weight them. Deterministic, which keeps
/// recall ordering reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalCrossEncoder;

impl LexicalCrossEncoder {
    /// Creates a new lexical cross-encoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(ToString::to_string)
            .collect()
    }
}

impl CrossEncoder for LexicalCrossEncoder {
    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        let query_terms: HashSet<String> = Self::tokenize(query).into_iter().collect();
        if query_terms.is_empty() || passages.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }

        let passage_tokens: Vec<Vec<String>> =
            passages.iter().map(|p| Self::tokenize(p)).collect();

        // Document frequency of each query term over the shortlist.
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for tokens in &passage_tokens {
            let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
            for term in &query_terms {
                if unique.contains(term.as_str()) {
                    *doc_freq.entry(term.as_str()).or_insert(0) += 1;
                }
            }
        }

        let n = passages.len() as f32;
        let scores = passage_tokens
            .iter()
            .map(|tokens| {
                let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
                let mut score = 0.0f32;
                for term in &query_terms {
                    if unique.contains(term.as_str()) {
                        let df = doc_freq.get(term.as_str()).copied().unwrap_or(1) as f32;
                        score += ((n + 1.0) / df).ln();
                    }
                }
                // Dampen long passages slightly.
                score / (1.0 + (tokens.len() as f32).sqrt() * 0.05)
            })
            .collect();

        Ok(scores)
    }
}
