//! Directive types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A hard rule injected into reflect prompts.
///
/// Active directives are listed in descending priority; tag-scoped
/// directives apply only when the reflect call shares a tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    /// Unique identifier (UUID v4 in string form).
    pub id: String,
    /// Owning bank.
    pub bank_id: String,
    /// Short display name.
    pub name: String,
    /// The rule text.
    pub content: String,
    /// Injection order; higher priority first. Non-negative.
    pub priority: i64,
    /// Whether the directive is currently injected.
    pub is_active: bool,
    /// Scope tags; empty means bank-wide.
    pub tags: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
