//! Reflection (curated summary) types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-curated summary document. Highest-priority retrieval source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    /// Unique identifier (UUID v4 in string form).
    pub id: String,
    /// Owning bank.
    pub bank_id: String,
    /// Short display name.
    pub name: String,
    /// The query this reflection answers.
    pub source_query: String,
    /// The curated content.
    pub content: String,
    /// Unit-normalized embedding of `content`.
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// Full structured response of the reflect call that produced this
    /// reflection, when one did.
    pub reflect_response: Option<serde_json::Value>,
    /// Scope tags.
    pub tags: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}
