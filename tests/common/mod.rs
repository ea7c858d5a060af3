//! Shared test doubles and helpers for the integration suites.

#![allow(clippy::expect_used, clippy::unwrap_used, dead_code)]

use engram::llm::{CompletionRequest, LlmClient};
use engram::{EngramConfig, MemoryEngine};
use std::sync::{Arc, Mutex};

/// One recorded LLM call: scope, system prompt, and the last user
/// message.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub scope: String,
    pub system: String,
    pub last_user: String,
}

/// Scripted LLM client: a handler closure keyed on the request scope,
/// with every call recorded for assertions.
pub struct ScriptedLlm {
    handler: Box<dyn Fn(&CompletionRequest) -> engram::Result<String> + Send + Sync>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlm {
    pub fn new(
        handler: impl Fn(&CompletionRequest) -> engram::Result<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for_scope(&self, scope: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.scope == scope)
            .collect()
    }
}

impl LlmClient for ScriptedLlm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn complete(&self, request: &CompletionRequest) -> engram::Result<String> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == engram::llm::MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let system = request
            .messages
            .iter()
            .find(|m| m.role == engram::llm::MessageRole::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(RecordedCall {
            scope: request.scope.to_string(),
            system,
            last_user,
        });
        (self.handler)(request)
    }
}

/// Builds a fact object for an extraction response.
pub fn fact_json(
    text: &str,
    fact_type: &str,
    event_date: Option<&str>,
    entities: &[(&str, &str)],
    causal: &[(i64, &str)],
) -> serde_json::Value {
    serde_json::json!({
        "text": text,
        "event_date": event_date,
        "fact_type": fact_type,
        "entities": entities
            .iter()
            .map(|(name, entity_type)| serde_json::json!({
                "text": name,
                "entity_type": entity_type,
            }))
            .collect::<Vec<_>>(),
        "causal_relations": causal
            .iter()
            .map(|(target, relation)| serde_json::json!({
                "target_fact_index": target,
                "relation_type": relation,
            }))
            .collect::<Vec<_>>(),
    })
}

/// Wraps facts into the extraction response envelope.
pub fn extraction_response(facts: &[serde_json::Value]) -> String {
    serde_json::json!({ "facts": facts }).to_string()
}

/// A consolidation response that leaves every model untouched.
pub fn consolidation_none() -> String {
    serde_json::json!({ "actions": [{ "action": "none" }] }).to_string()
}

/// An opinion-extraction response with no opinions.
pub fn no_opinions() -> String {
    serde_json::json!({ "opinions": [] }).to_string()
}

/// Opens a fully synchronous engine backed by the scripted LLM and the
/// deterministic hash embedder.
pub fn sync_engine(llm: Arc<ScriptedLlm>) -> MemoryEngine {
    MemoryEngine::open(
        EngramConfig::default().synchronous(),
        llm,
        Arc::new(engram::embedding::HashEmbedder::new()),
    )
    .expect("engine open")
}
