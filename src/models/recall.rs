//! Recall and retain request/response types.

use super::entity::Entity;
use super::memory::{FactType, MemoryUnit};
use super::reflection::Reflection;
use super::trace::RecallTrace;
use crate::config::RecallBudget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag filter policy.
///
/// The non-strict modes treat untagged units as bank-wide and keep them;
/// the strict modes exclude them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    /// Unit matches if it shares any tag, or has no tags.
    #[default]
    Any,
    /// Unit matches if it has every tag, or has no tags.
    All,
    /// Unit matches only if it shares any tag.
    AnyStrict,
    /// Unit matches only if it has every tag.
    AllStrict,
}

impl TagMatch {
    /// Applies the policy to a unit's tags. An empty filter set matches
    /// everything.
    #[must_use]
    pub fn matches(self, filter: &[String], unit_tags: &[String]) -> bool {
        if filter.is_empty() {
            return true;
        }
        if unit_tags.is_empty() {
            return matches!(self, Self::Any | Self::All);
        }
        match self {
            Self::Any | Self::AnyStrict => filter.iter().any(|t| unit_tags.contains(t)),
            Self::All | Self::AllStrict => filter.iter().all(|t| unit_tags.contains(t)),
        }
    }
}

/// Optional related data attached to a recall result.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IncludeOptions {
    /// Include entities referenced by the returned units.
    #[serde(default)]
    pub entities: bool,
    /// Include a reflections recall alongside the unit recall.
    #[serde(default)]
    pub reflections: bool,
    /// Include a mental-model recall alongside the unit recall.
    #[serde(default)]
    pub mental_models: bool,
}

/// Parameters for a recall call.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    /// Restrict results to these fact types; empty means all raw types.
    pub fact_types: Vec<FactType>,
    /// Tag filter set.
    pub tags: Vec<String>,
    /// Tag filter policy.
    pub tags_match: TagMatch,
    /// Token budget for the packed result.
    pub max_tokens: usize,
    /// Effort level.
    pub budget: RecallBudget,
    /// Emit a full retrieval trace.
    pub enable_trace: bool,
    /// Related data to attach.
    pub include: IncludeOptions,
    /// Reference time for temporal expressions; defaults to now.
    pub reference_time: Option<DateTime<Utc>>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            fact_types: Vec::new(),
            tags: Vec::new(),
            tags_match: TagMatch::default(),
            max_tokens: 4096,
            budget: RecallBudget::default(),
            enable_trace: false,
            include: IncludeOptions::default(),
            reference_time: None,
        }
    }
}

/// One recalled unit with its final score.
#[derive(Debug, Clone)]
pub struct RecalledUnit {
    /// The unit.
    pub unit: MemoryUnit,
    /// Blended final score after reranking.
    pub score: f32,
}

/// The result of a recall call.
///
/// Always returned, possibly empty; recall never fails because of upstream
/// LLM issues.
#[derive(Debug, Clone, Default)]
pub struct RecallResult {
    /// Selected units in final order.
    pub results: Vec<RecalledUnit>,
    /// Entities referenced by the returned units, when requested.
    pub entities: Vec<Entity>,
    /// Reflection recall, when requested.
    pub reflections: Vec<Reflection>,
    /// Mental-model recall, when requested.
    pub mental_models: Vec<RecalledUnit>,
    /// Retrieval trace, when requested.
    pub trace: Option<RecallTrace>,
}

/// Parameters for a retain call.
#[derive(Debug, Clone, Default)]
pub struct RetainOptions {
    /// Free-text context passed to extraction (conversation setting,
    /// speaker identity, and similar).
    pub context: Option<String>,
    /// Reference date for relative temporal expressions; defaults to now.
    pub event_date: Option<DateTime<Utc>>,
    /// Owning document id; enables document upsert semantics.
    pub document_id: Option<String>,
    /// Tags applied to every produced unit.
    pub tags: Vec<String>,
    /// Metadata applied to every produced unit.
    pub metadata: BTreeMap<String, String>,
}

/// One item of a retain batch.
#[derive(Debug, Clone)]
pub struct RetainItem {
    /// The text to ingest.
    pub content: String,
    /// Free-text context for extraction.
    pub context: Option<String>,
    /// Reference date for relative temporal expressions.
    pub event_date: Option<DateTime<Utc>>,
    /// Tags applied to this item's units.
    pub tags: Vec<String>,
    /// Metadata applied to this item's units.
    pub metadata: BTreeMap<String, String>,
}

impl RetainItem {
    /// Creates an item with just content.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            context: None,
            event_date: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_tag_match_empty_filter_matches_all() {
        assert!(TagMatch::AllStrict.matches(&[], &tags(&["a"])));
        assert!(TagMatch::Any.matches(&[], &[]));
    }

    #[test]
    fn test_tag_match_untagged_units() {
        let filter = tags(&["work"]);
        assert!(TagMatch::Any.matches(&filter, &[]));
        assert!(TagMatch::All.matches(&filter, &[]));
        assert!(!TagMatch::AnyStrict.matches(&filter, &[]));
        assert!(!TagMatch::AllStrict.matches(&filter, &[]));
    }

    #[test]
    fn test_tag_match_any_vs_all() {
        let filter = tags(&["a", "b"]);
        let unit = tags(&["a"]);
        assert!(TagMatch::Any.matches(&filter, &unit));
        assert!(TagMatch::AnyStrict.matches(&filter, &unit));
        assert!(!TagMatch::All.matches(&filter, &unit));
        assert!(!TagMatch::AllStrict.matches(&filter, &unit));

        let unit = tags(&["a", "b", "c"]);
        assert!(TagMatch::All.matches(&filter, &unit));
        assert!(TagMatch::AllStrict.matches(&filter, &unit));
    }
}
