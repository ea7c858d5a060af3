//! Recall trace structures.
//!
//! The trace schema is a stable nested structure; every field is emitted
//! even when empty so downstream consumers can rely on its shape.

use serde::{Deserialize, Serialize};

/// Query-level information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryInfo {
    /// The raw query text.
    pub query: String,
    /// Requested fact types.
    pub fact_types: Vec<String>,
    /// Budget label ("low", "mid", "high").
    pub budget: String,
    /// Detected temporal constraint, as `[start, end]` ISO strings.
    pub temporal_constraint: Option<(String, String)>,
}

/// One retrieval signal's contribution to the seed set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Signal name: `vector`, `lexical`, `entity`, or `recent`.
    pub signal: String,
    /// Candidates the signal produced.
    pub count: usize,
    /// Best raw score before normalization.
    pub max_score: f32,
}

/// Per-signal score components of one visited node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WeightComponents {
    /// Normalized vector-similarity contribution.
    pub vector: f32,
    /// Normalized lexical contribution.
    pub lexical: f32,
    /// Normalized entity-match contribution.
    pub entity: f32,
    /// Normalized recency contribution.
    pub recent: f32,
    /// Activation accumulated through link traversal.
    pub activation: f32,
}

/// A node visited during spreading activation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeVisit {
    /// The visited unit.
    pub unit_id: String,
    /// Activation round that (last) touched the node; 0 for seeds.
    pub round: usize,
    /// Activation after the round.
    pub activation: f32,
    /// Score components.
    pub components: WeightComponents,
    /// Unit context, when present. Tolerates nulls: mental-model units may
    /// have no context.
    pub context: Option<String>,
}

/// One traversed link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkInfo {
    /// Source unit.
    pub from_unit: String,
    /// Target unit.
    pub to_unit: String,
    /// Link type label.
    pub link_type: String,
    /// Stored edge weight.
    pub weight: f32,
    /// Activation contributed across this edge.
    pub contribution: f32,
}

/// A pruning decision at a stage boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruningDecision {
    /// Stage name: `activation_topk`, `tag_filter`, `temporal_filter`,
    /// `shortlist`, `mmr`, `token_budget`.
    pub stage: String,
    /// Candidates entering the stage.
    pub before: usize,
    /// Candidates surviving the stage.
    pub after: usize,
}

/// Wall-clock accounting for one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseMetric {
    /// Phase name.
    pub phase: String,
    /// Elapsed milliseconds.
    pub elapsed_ms: u64,
}

/// Final selection entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionScore {
    /// The selected unit.
    pub unit_id: String,
    /// Blended final score.
    pub final_score: f32,
    /// Cross-encoder score before blending.
    pub cross_score: f32,
    /// Activation before blending.
    pub activation: f32,
}

/// Aggregate counts for the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Size of the seed union.
    pub seed_count: usize,
    /// Nodes alive after the last activation round.
    pub activated_count: usize,
    /// Shortlist size handed to the cross-encoder.
    pub shortlist_count: usize,
    /// Units in the final result.
    pub selected_count: usize,
}

/// The full retrieval trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallTrace {
    /// Query-level information.
    pub query_info: QueryInfo,
    /// Per-signal seed contributions.
    pub entry_points: Vec<EntryPoint>,
    /// Nodes visited during activation.
    pub node_visits: Vec<NodeVisit>,
    /// Seed weighting used for this run.
    pub weight_components: WeightComponents,
    /// Traversed links.
    pub link_info: Vec<LinkInfo>,
    /// Stage-boundary pruning decisions.
    pub pruning_decisions: Vec<PruningDecision>,
    /// Final selection scores.
    pub selection: Vec<SelectionScore>,
    /// Aggregate counts.
    pub summary: TraceSummary,
    /// Per-phase wall-clock accounting.
    pub phase_metrics: Vec<PhaseMetric>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_trace_serializes_all_fields() {
        let trace = RecallTrace::default();
        let value = serde_json::to_value(&trace).unwrap();
        for field in [
            "query_info",
            "entry_points",
            "node_visits",
            "weight_components",
            "link_info",
            "pruning_decisions",
            "selection",
            "summary",
            "phase_metrics",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn test_node_visit_tolerates_null_context() {
        let json = r#"{"unit_id": "u1", "round": 1, "activation": 0.5,
                       "components": {"vector": 0.5, "lexical": 0.0, "entity": 0.0,
                                      "recent": 0.0, "activation": 0.0},
                       "context": null}"#;
        let visit: NodeVisit = serde_json::from_str(json).unwrap();
        assert!(visit.context.is_none());
    }
}
