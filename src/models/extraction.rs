//! Fact extraction response types.
//!
//! These are the schema boundary for the extraction LLM call: dynamic JSON
//! is parsed into tagged types here, then hard-validated before anything
//! reaches storage.

use super::entity::EntityMention;
use serde::{Deserialize, Serialize};

/// The kind of a causal relation between two extracted facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalRelationType {
    /// The target fact caused this one.
    CausedBy,
    /// The target fact made this one possible.
    EnabledBy,
    /// The target fact prevented this one.
    PreventedBy,
}

/// A causal relation from one extracted fact to an earlier one.
///
/// `target_fact_index` refers to a fact earlier in the same extraction
/// response; by construction the first fact can carry no relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalRelation {
    /// Index of the target fact within the response, strictly less than the
    /// index of the fact carrying this relation.
    pub target_fact_index: i64,
    /// Relation kind.
    pub relation_type: CausalRelationType,
}

/// A single fact extracted from a chunk of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    /// Self-contained factual statement: subject, action, context.
    pub text: String,
    /// Absolute ISO-8601 date/time when the fact occurred. Relative
    /// expressions in the source text are resolved against the retain
    /// reference date before this field is emitted.
    pub event_date: Option<String>,
    /// One of `world`, `experience`, `opinion`.
    pub fact_type: String,
    /// Entities mentioned in this fact.
    #[serde(default)]
    pub entities: Vec<EntityMention>,
    /// Relations to earlier facts in the same response.
    #[serde(default)]
    pub causal_relations: Vec<CausalRelation>,
}

/// The full extraction response for one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResponse {
    /// Extracted facts, in source order.
    #[serde(default)]
    pub facts: Vec<ExtractedFact>,
}

impl ExtractionResponse {
    /// Hard-validates causal relations: every `target_fact_index` must be
    /// in `[0, index)` of the fact carrying it. Offending relations are
    /// dropped; facts themselves are kept.
    pub fn validate_causal_relations(&mut self) -> usize {
        let mut dropped = 0;
        for (index, fact) in self.facts.iter_mut().enumerate() {
            let before = fact.causal_relations.len();
            fact.causal_relations.retain(|relation| {
                relation.target_fact_index >= 0
                    && (usize::try_from(relation.target_fact_index).unwrap_or(usize::MAX)) < index
            });
            dropped += before - fact.causal_relations.len();
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(text: &str, relations: Vec<CausalRelation>) -> ExtractedFact {
        ExtractedFact {
            text: text.to_string(),
            event_date: None,
            fact_type: "world".to_string(),
            entities: Vec::new(),
            causal_relations: relations,
        }
    }

    #[test]
    fn test_first_fact_never_keeps_relations() {
        let mut response = ExtractionResponse {
            facts: vec![fact(
                "a",
                vec![CausalRelation {
                    target_fact_index: 0,
                    relation_type: CausalRelationType::CausedBy,
                }],
            )],
        };
        let dropped = response.validate_causal_relations();
        assert_eq!(dropped, 1);
        assert!(response.facts[0].causal_relations.is_empty());
    }

    #[test]
    fn test_forward_and_negative_references_dropped() {
        let mut response = ExtractionResponse {
            facts: vec![
                fact("a", Vec::new()),
                fact(
                    "b",
                    vec![
                        CausalRelation {
                            target_fact_index: 0,
                            relation_type: CausalRelationType::CausedBy,
                        },
                        CausalRelation {
                            target_fact_index: 5,
                            relation_type: CausalRelationType::EnabledBy,
                        },
                        CausalRelation {
                            target_fact_index: -1,
                            relation_type: CausalRelationType::PreventedBy,
                        },
                    ],
                ),
            ],
        };
        let dropped = response.validate_causal_relations();
        assert_eq!(dropped, 2);
        assert_eq!(response.facts[1].causal_relations.len(), 1);
        assert_eq!(response.facts[1].causal_relations[0].target_fact_index, 0);
    }

    #[test]
    fn test_deserialize_extraction_response() {
        let json = r#"{
            "facts": [
                {"text": "I lost my job in January.", "event_date": "2024-01-15T00:00:00Z",
                 "fact_type": "experience", "entities": [], "causal_relations": []},
                {"text": "Because I lost my job, I could not pay rent.",
                 "fact_type": "experience",
                 "entities": [{"text": "rent", "entity_type": "concept"}],
                 "causal_relations": [{"target_fact_index": 0, "relation_type": "caused_by"}]}
            ]
        }"#;
        let response: ExtractionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.facts.len(), 2);
        assert_eq!(
            response.facts[1].causal_relations[0].relation_type,
            CausalRelationType::CausedBy
        );
    }
}
