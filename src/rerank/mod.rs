//! Cross-encoder rescoring.
//!
//! A cross-encoder scores `(query, passage)` pairs jointly and is used only
//! to reorder the recall shortlist. Scores are raw and unbounded; the
//! recall engine min-max normalizes them before blending.

mod lexical;

pub use lexical::LexicalCrossEncoder;

use crate::Result;

/// Trait for pairwise `(query, passage)` rescorers.
pub trait CrossEncoder: Send + Sync {
    /// Scores each passage against the query. Output length equals input
    /// length and order is preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if scoring fails.
    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>>;
}
