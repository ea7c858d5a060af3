//! Configuration management.
//!
//! One immutable [`EngramConfig`] struct is constructed at process start and
//! threaded through every component. Per-call overrides live on the request
//! options types, never in mutable globals.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Recall effort level, mapping to numeric caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallBudget {
    /// Cheapest: 50 candidates, one activation round.
    Low,
    /// Default: 150 candidates, two activation rounds.
    #[default]
    Mid,
    /// Thorough: 400 candidates, three activation rounds.
    High,
}

/// Numeric caps derived from a [`RecallBudget`].
#[derive(Debug, Clone, Copy)]
pub struct BudgetCaps {
    /// Per-signal candidate count during seed gathering.
    pub candidate_k: usize,
    /// Spreading-activation rounds.
    pub activation_rounds: usize,
    /// Shortlist size handed to the cross-encoder.
    pub shortlist: usize,
    /// MMR trade-off between relevance and diversity.
    pub mmr_lambda: f32,
    /// Maximum reflect agent tool-loop steps.
    pub max_agent_steps: usize,
}

impl RecallBudget {
    /// Returns the numeric caps for this budget level.
    #[must_use]
    pub const fn caps(self) -> BudgetCaps {
        match self {
            Self::Low => BudgetCaps {
                candidate_k: 50,
                activation_rounds: 1,
                shortlist: 20,
                mmr_lambda: 0.5,
                max_agent_steps: 3,
            },
            Self::Mid => BudgetCaps {
                candidate_k: 150,
                activation_rounds: 2,
                shortlist: 60,
                mmr_lambda: 0.5,
                max_agent_steps: 6,
            },
            Self::High => BudgetCaps {
                candidate_k: 400,
                activation_rounds: 3,
                shortlist: 150,
                mmr_lambda: 0.5,
                max_agent_steps: 10,
            },
        }
    }

    /// Parses a budget label ("low", "mid", "high").
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "mid" | "medium" => Some(Self::Mid),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Retain pipeline tunables.
#[derive(Debug, Clone)]
pub struct RetainConfig {
    /// Maximum characters per extraction chunk.
    pub chunk_max_chars: usize,
    /// Cosine similarity at or above which a new fact is a duplicate of an
    /// existing unit of the same fact type.
    pub dedup_threshold: f32,
    /// Cosine similarity at or above which a semantic link is created.
    ///
    /// Deliberately a separate tunable from `dedup_threshold`.
    pub semantic_link_threshold: f32,
    /// Neighbors considered for semantic links per new unit.
    pub semantic_link_k: usize,
    /// Neighbors considered for temporal links per new unit.
    pub temporal_link_k: usize,
    /// Half-width of the temporal link window, in hours.
    pub temporal_window_hours: i64,
    /// Maximum concurrently extracted chunks.
    pub max_parallel_chunks: usize,
}

impl Default for RetainConfig {
    fn default() -> Self {
        Self {
            chunk_max_chars: 50_000,
            dedup_threshold: 0.90,
            semantic_link_threshold: 0.70,
            semantic_link_k: 10,
            temporal_link_k: 10,
            temporal_window_hours: 72,
            max_parallel_chunks: 4,
        }
    }
}

/// Recall engine tunables.
#[derive(Debug, Clone)]
pub struct RecallConfig {
    /// Seed weight for the vector signal.
    pub weight_vector: f32,
    /// Seed weight for the lexical signal.
    pub weight_lexical: f32,
    /// Seed weight for the entity signal.
    pub weight_entity: f32,
    /// Seed weight for the recency signal.
    pub weight_recent: f32,
    /// Per-round retention of a node's previous activation.
    pub activation_decay: f32,
    /// Blend factor for the cross-encoder score (activation gets the rest).
    pub rerank_blend: f32,
    /// Flat token overhead added per packed unit.
    pub token_overhead: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            weight_vector: 0.5,
            weight_lexical: 0.2,
            weight_entity: 0.2,
            weight_recent: 0.1,
            activation_decay: 0.5,
            rerank_blend: 0.6,
            token_overhead: 8,
        }
    }
}

/// Consolidation engine tunables.
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Whether mental models are produced at all.
    ///
    /// When disabled, consolidation returns without touching watermarks so
    /// units remain eligible once re-enabled.
    pub enable_mental_models: bool,
    /// ANN candidates added to the tag-routed candidate set per unit.
    pub candidate_k: usize,
    /// Maximum raw units processed per consolidation run.
    pub batch_limit: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enable_mental_models: true,
            candidate_k: 5,
            batch_limit: 200,
        }
    }
}

/// Entity resolver tunables.
#[derive(Debug, Clone)]
pub struct EntityConfig {
    /// Similarity at or above which a mention resolves to an existing entity.
    pub accept_threshold: f32,
    /// Width of the band below `accept_threshold` in which multiple
    /// candidates are considered ambiguous and the LLM is consulted.
    pub ambiguity_band: f32,
    /// ANN candidates fetched per distinct mention.
    pub candidate_k: usize,
    /// Entries in the per-process `(bank, normalized, type)` cache.
    pub cache_capacity: usize,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.85,
            ambiguity_band: 0.05,
            candidate_k: 5,
            cache_capacity: 4096,
        }
    }
}

/// Task backend mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    /// In-process worker threads; submit returns immediately.
    #[default]
    Background,
    /// Submit runs the task inline. Used by tests and synchronous callers.
    Inline,
}

/// Task backend tunables.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Execution mode.
    pub mode: TaskMode,
    /// Worker threads in background mode.
    pub workers: usize,
    /// Bounded queue depth in background mode.
    pub queue_depth: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            mode: TaskMode::Background,
            workers: 2,
            queue_depth: 256,
        }
    }
}

/// Main configuration for engram.
#[derive(Debug, Clone)]
pub struct EngramConfig {
    /// Path to the SQLite database file. `None` opens an in-memory store.
    pub db_path: Option<PathBuf>,
    /// Retain pipeline tunables.
    pub retain: RetainConfig,
    /// Recall engine tunables.
    pub recall: RecallConfig,
    /// Consolidation engine tunables.
    pub consolidation: ConsolidationConfig,
    /// Entity resolver tunables.
    pub entity: EntityConfig,
    /// Task backend tunables.
    pub tasks: TaskConfig,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            retain: RetainConfig::default(),
            recall: RecallConfig::default(),
            consolidation: ConsolidationConfig::default(),
            entity: EntityConfig::default(),
            tasks: TaskConfig::default(),
        }
    }
}

impl EngramConfig {
    /// Creates a configuration backed by the given database file.
    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Switches the task backend to inline (synchronous) execution.
    #[must_use]
    pub const fn synchronous(mut self) -> Self {
        self.tasks.mode = TaskMode::Inline;
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `ENGRAM_DB_PATH` | `db_path` |
    /// | `ENGRAM_CHUNK_MAX_CHARS` | `retain.chunk_max_chars` |
    /// | `ENGRAM_DEDUP_THRESHOLD` | `retain.dedup_threshold` |
    /// | `ENGRAM_SEMANTIC_LINK_THRESHOLD` | `retain.semantic_link_threshold` |
    /// | `ENGRAM_TEMPORAL_WINDOW_HOURS` | `retain.temporal_window_hours` |
    /// | `ENGRAM_ENABLE_MENTAL_MODELS` | `consolidation.enable_mental_models` |
    /// | `ENGRAM_TASK_WORKERS` | `tasks.workers` |
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("ENGRAM_DB_PATH") {
            if !v.is_empty() {
                self.db_path = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_CHUNK_MAX_CHARS") {
            self.retain.chunk_max_chars = v.max(1);
        }
        if let Some(v) = env_parse::<f32>("ENGRAM_DEDUP_THRESHOLD") {
            self.retain.dedup_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<f32>("ENGRAM_SEMANTIC_LINK_THRESHOLD") {
            self.retain.semantic_link_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<i64>("ENGRAM_TEMPORAL_WINDOW_HOURS") {
            self.retain.temporal_window_hours = v.max(1);
        }
        if let Some(v) = env_parse::<bool>("ENGRAM_ENABLE_MENTAL_MODELS") {
            self.consolidation.enable_mental_models = v;
        }
        if let Some(v) = env_parse::<usize>("ENGRAM_TASK_WORKERS") {
            self.tasks.workers = v.max(1);
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_caps_ordering() {
        let low = RecallBudget::Low.caps();
        let mid = RecallBudget::Mid.caps();
        let high = RecallBudget::High.caps();
        assert!(low.candidate_k < mid.candidate_k);
        assert!(mid.candidate_k < high.candidate_k);
        assert!(low.activation_rounds < high.activation_rounds);
        assert_eq!(low.shortlist, 20);
        assert_eq!(high.shortlist, 150);
    }

    #[test]
    fn test_budget_parse() {
        assert_eq!(RecallBudget::parse("low"), Some(RecallBudget::Low));
        assert_eq!(RecallBudget::parse("MID"), Some(RecallBudget::Mid));
        assert_eq!(RecallBudget::parse("high"), Some(RecallBudget::High));
        assert_eq!(RecallBudget::parse("ultra"), None);
    }

    #[test]
    fn test_dedup_and_semantic_thresholds_are_distinct() {
        let config = RetainConfig::default();
        assert!(config.dedup_threshold > config.semantic_link_threshold);
    }

    #[test]
    fn test_synchronous_builder() {
        let config = EngramConfig::default().synchronous();
        assert_eq!(config.tasks.mode, TaskMode::Inline);
    }
}
