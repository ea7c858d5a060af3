//! # Engram
//!
//! An agentic long-term memory engine for LLM-backed applications.
//!
//! Engram ingests free-form text for a tenant ("bank"), extracts durable
//! facts and entities with an LLM, persists them as a linked graph with
//! embeddings, and answers queries over that graph through semantic recall,
//! consolidated mental models, and a bounded tool-using reflect agent.
//!
//! ## Features
//!
//! - Retain pipeline: chunking, LLM fact extraction, entity resolution,
//!   deduplication, and temporal/semantic/entity link synthesis
//! - Recall engine: multi-signal seeding, spreading activation over the
//!   memory graph, cross-encoder reranking, and MMR diversification
//! - Consolidation engine: watermark-driven extraction of mental models
//!   with tag-scope routing and bidirectional source traceability
//! - Reflect agent: a bounded tool loop over reflections, mental models,
//!   and recall, shaped by per-bank directives and disposition
//! - Single-file SQLite storage with FTS5 and embedded migrations
//!
//! ## Example
//!
//! ```rust,ignore
//! use engram::{EngramConfig, MemoryEngine, RecallOptions, RetainOptions};
//!
//! let engine = MemoryEngine::open(EngramConfig::default(), llm, embedder)?;
//! engine.retain("personal", "I moved to Lisbon in March.", RetainOptions::default())?;
//! let result = engine.recall("personal", "where do I live?", RecallOptions::default())?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod embedding;
pub mod engine;
pub mod llm;
pub mod models;
pub mod observability;
pub mod rerank;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::{ConsolidationConfig, EngramConfig, RecallBudget, RetainConfig};
pub use embedding::Embedder;
pub use engine::MemoryEngine;
pub use llm::LlmClient;
pub use models::{
    Bank, Directive, Disposition, Document, Entity, EntityType, FactType, LinkType, MemoryUnit,
    Operation, OperationStatus, RecallOptions, RecallResult, Reflection, RetainOptions, TagMatch,
    UnitId,
};
pub use rerank::CrossEncoder;
pub use services::{ConsolidationOutcome, RecallEngine, ReflectAgent, RetainPipeline, TaskBackend};
pub use storage::SqliteStore;

/// Error type for engram operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty bank id, empty text, unknown fact type, bad tags |
/// | `NotFound` | A referenced bank, unit, document, or reflection is missing |
/// | `Conflict` | Unique-constraint collision that the caller must resolve |
/// | `Transient` | Provider rate limit or network timeout, retried upstream |
/// | `OutputTooLong` | The LLM hit its output cap; drives chunk splitting |
/// | `ValidationFailed` | LLM output did not match the required schema |
/// | `OperationFailed` | Storage errors, exhausted retries, fatal conditions |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - `bank_id` is empty or a tag is the empty string
    /// - Retained content is empty
    /// - A directive priority is negative or a fact type string is unknown
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique-constraint collision that could not be absorbed locally.
    ///
    /// Link and entity collisions are normally treated as success (the
    /// colliding row wins); this surfaces only when that policy does not
    /// apply.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A transient provider or network failure.
    ///
    /// Retried with exponential backoff by [`llm::ResilientLlmClient`];
    /// escalated to [`Error::OperationFailed`] once attempts are exhausted.
    #[error("transient failure in '{operation}': {cause}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The LLM exceeded its output-length cap.
    ///
    /// Caught only inside the retain pipeline, where it triggers a recursive
    /// midpoint split of the offending chunk.
    #[error("llm output exceeded the length cap")]
    OutputTooLong,

    /// The LLM produced output that failed schema validation after retries.
    ///
    /// Recoverable for fact extraction (the fact group is skipped); fatal
    /// for reflect structured output (the raw text is returned instead).
    #[error("validation failed in '{operation}': {cause}")]
    ValidationFailed {
        /// The operation whose output failed validation.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` operations fail
    /// - LLM retries are exhausted
    /// - A task backend worker cannot accept work
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Shorthand for an [`Error::OperationFailed`] value.
    pub fn op(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::OperationFailed {
            operation: "sqlite".to_string(),
            cause: e.to_string(),
        }
    }
}

/// Result type alias for engram operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("empty bank_id".to_string());
        assert_eq!(err.to_string(), "invalid input: empty bank_id");

        let err = Error::OperationFailed {
            operation: "retain".to_string(),
            cause: "db locked".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'retain' failed: db locked");

        let err = Error::OutputTooLong;
        assert_eq!(err.to_string(), "llm output exceeded the length cap");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::OperationFailed { .. }));
    }
}
