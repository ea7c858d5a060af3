//! Business logic services.
//!
//! Each service owns one stage of the engine: chunking, extraction, entity
//! resolution, deduplication, link synthesis, retain, recall,
//! consolidation, reflect, and the task backend. Services hold `Arc`
//! handles injected at construction; nothing lives in module-level state.

// Score and weight arithmetic tolerates f32 precision loss.
#![allow(clippy::cast_precision_loss)]

pub mod chunker;
pub mod consolidation;
pub mod dedup;
pub mod entity_resolver;
pub mod extraction;
pub mod links;
pub mod query_analyzer;
pub mod recall;
pub mod reflect;
pub mod retain;
pub mod tasks;

pub use consolidation::{ConsolidationEngine, ConsolidationOutcome};
pub use dedup::DedupChecker;
pub use entity_resolver::EntityResolver;
pub use extraction::{ExtractionContext, FactExtractor};
pub use links::LinkSynthesizer;
pub use query_analyzer::{QueryAnalysis, QueryAnalyzer, TemporalConstraint};
pub use recall::RecallEngine;
pub use reflect::{AgentStep, ExtractedOpinion, ReflectAgent, ReflectOptions, ReflectResult};
pub use retain::{RetainOutcome, RetainPipeline};
pub use tasks::{build_task_backend, BackgroundTaskBackend, InlineTaskBackend, Job, TaskBackend};
