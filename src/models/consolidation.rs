//! Consolidation action and history types.
//!
//! The schema boundary for the consolidation LLM call: the model proposes
//! one action per routed unit, parsed into a tagged enum and re-validated
//! against the tag-scope rules before anything is applied.

use super::memory::UnitId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An action proposed for one raw unit against the candidate mental models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConsolidationAction {
    /// The unit refines, contradicts, or extends an existing model.
    Update {
        /// The model being updated.
        model_id: String,
        /// The model's full replacement summary text.
        summary: String,
    },
    /// No existing model fits; create a new one.
    Create {
        /// Short model name.
        name: String,
        /// The model's summary text.
        summary: String,
        /// Scope tags for the new model.
        #[serde(default)]
        tags: Vec<String>,
    },
    /// The unit is noise; no model should change.
    None,
}

/// A structured change record appended to a mental model's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChange {
    /// When the change was applied.
    pub timestamp: DateTime<Utc>,
    /// Model text before the change.
    pub before_text: String,
    /// Model text after the change.
    pub after_text: String,
    /// The raw unit whose consolidation triggered the change.
    pub trigger_unit_id: UnitId,
}
