//! Data models for engram.
//!
//! This module contains all the core data structures used throughout the
//! system. Everything is scoped by `bank_id`; graph edges carry ids, never
//! owning references.

mod bank;
mod consolidation;
mod directive;
mod document;
mod entity;
mod extraction;
mod link;
mod memory;
mod operation;
mod recall;
mod reflection;
pub mod trace;

pub use bank::{Bank, Disposition};
pub use consolidation::{ConsolidationAction, ModelChange};
pub use directive::Directive;
pub use document::Document;
pub use entity::{normalize_name, Entity, EntityId, EntityMention, EntityType};
pub use extraction::{CausalRelation, CausalRelationType, ExtractedFact, ExtractionResponse};
pub use link::{LinkType, MemoryLink};
pub use memory::{FactType, MemoryUnit, UnitId};
pub use operation::{Operation, OperationStatus, OperationType};
pub use recall::{
    IncludeOptions, RecallOptions, RecallResult, RecalledUnit, RetainItem, RetainOptions, TagMatch,
};
pub use reflection::Reflection;
pub use trace::RecallTrace;

/// Validates a tag set: tags are case-sensitive and must be non-empty.
///
/// Returns a sorted, deduplicated copy.
///
/// # Errors
///
/// Returns [`crate::Error::InvalidInput`] if any tag is the empty string.
pub fn normalize_tags(tags: &[String]) -> crate::Result<Vec<String>> {
    if tags.iter().any(|t| t.is_empty()) {
        return Err(crate::Error::InvalidInput(
            "empty string is not a valid tag".to_string(),
        ));
    }
    let mut out: Vec<String> = tags.to_vec();
    out.sort();
    out.dedup();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tags_sorts_and_dedupes() {
        let tags = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        let normalized = normalize_tags(&tags).unwrap();
        assert_eq!(normalized, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_normalize_tags_rejects_empty() {
        let tags = vec![String::new()];
        assert!(normalize_tags(&tags).is_err());
    }

    #[test]
    fn test_normalize_tags_case_sensitive() {
        let tags = vec!["Work".to_string(), "work".to_string()];
        let normalized = normalize_tags(&tags).unwrap();
        assert_eq!(normalized.len(), 2);
    }
}
