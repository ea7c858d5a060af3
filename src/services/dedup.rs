//! Near-duplicate detection for new facts.

use crate::models::{FactType, UnitId};
use crate::storage::SqliteStore;
use crate::Result;
use std::sync::Arc;

/// Checks new facts against a bank's existing units by embedding
/// similarity, restricted to the same fact type.
pub struct DedupChecker {
    store: Arc<SqliteStore>,
    threshold: f32,
}

impl DedupChecker {
    /// Creates a checker with the given cosine threshold.
    #[must_use]
    pub const fn new(store: Arc<SqliteStore>, threshold: f32) -> Self {
        Self { store, threshold }
    }

    /// Returns the canonical existing unit when the candidate is a
    /// near-duplicate, `None` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the similarity query fails.
    pub fn check(
        &self,
        bank_id: &str,
        fact_type: FactType,
        embedding: &[f32],
    ) -> Result<Option<(UnitId, f32)>> {
        let hits = self
            .store
            .vector_top_k(bank_id, embedding, &[fact_type], 1, self.threshold)?;
        Ok(hits.into_iter().next())
    }
}
