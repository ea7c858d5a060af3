//! Document (ingestion batch) types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A batch unit of ingestion with a client-supplied id.
///
/// Retaining again with the same id replaces the document's prior units
/// (upsert semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Client-supplied opaque id, unique within a bank.
    pub id: String,
    /// Owning bank.
    pub bank_id: String,
    /// The full text as submitted.
    pub original_text: String,
    /// Free-form string metadata.
    pub metadata: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last replacement timestamp.
    pub updated_at: DateTime<Utc>,
}
