//! The reflect agent.
//!
//! A bounded tool loop over reflections, mental models, and recall. The
//! system prompt injects the bank profile, its active directives in
//! descending priority, and the disposition traits rendered qualitatively.
//! The agent is told to try reflections first, then mental models, and to
//! use recall and expand for verification or drill-down.

use super::recall::RecallEngine;
use crate::config::RecallBudget;
use crate::llm::{
    complete_structured, extract_json_from_response, validate_against_schema, ChatMessage,
    CompletionRequest, LlmClient,
};
use crate::models::{Bank, Disposition, FactType, RecallOptions, TagMatch, UnitId};
use crate::storage::SqliteStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How many times a schema-constrained final answer is re-prompted.
const SCHEMA_RETRIES: usize = 2;

/// Parameters for a reflect call.
#[derive(Debug, Clone, Default)]
pub struct ReflectOptions {
    /// Effort level; bounds the tool loop.
    pub budget: RecallBudget,
    /// Scope tags for directives and retrieval.
    pub tags: Vec<String>,
    /// Extra caller context appended to the question.
    pub context: Option<String>,
    /// When set, the final answer must be JSON validating against this
    /// schema.
    pub response_schema: Option<serde_json::Value>,
}

/// One recorded step of the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Step ordinal, starting at 1.
    pub step: usize,
    /// `tool` or `final`.
    pub action: String,
    /// Tool name for tool steps.
    pub tool: Option<String>,
    /// Abbreviated observation fed back to the model.
    pub observation_preview: String,
}

/// An opinion extracted from a reflect answer, staged for retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedOpinion {
    /// First-person opinion text.
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Result of a reflect call.
#[derive(Debug, Clone, Default)]
pub struct ReflectResult {
    /// The answer text (raw text when structured output failed).
    pub text: String,
    /// Validated structured output, when a schema was given and met.
    pub structured_output: Option<serde_json::Value>,
    /// Every unit id that entered the prompt at any step.
    pub based_on: Vec<UnitId>,
    /// The recorded tool loop.
    pub steps: Vec<AgentStep>,
    /// Whether the loop ended by exhausting its step budget.
    pub budget_exhausted: bool,
}

/// One action proposed by the agent model.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AgentAction {
    /// Invoke a tool.
    Tool {
        tool: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Produce the final answer.
    Final { answer: String },
}

#[derive(Debug, Deserialize)]
struct OpinionResponse {
    #[serde(default)]
    opinions: Vec<ExtractedOpinion>,
}

/// The reflect agent.
pub struct ReflectAgent {
    store: Arc<SqliteStore>,
    llm: Arc<dyn LlmClient>,
    recall: Arc<RecallEngine>,
}

impl ReflectAgent {
    /// Creates a new agent.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        llm: Arc<dyn LlmClient>,
        recall: Arc<RecallEngine>,
    ) -> Self {
        Self { store, llm, recall }
    }

    /// Runs the bounded tool loop and composes an answer.
    ///
    /// # Errors
    ///
    /// Returns an error for storage failures; tool failures degrade the
    /// answer instead of failing the call.
    pub fn reflect(
        &self,
        bank_id: &str,
        query: &str,
        options: &ReflectOptions,
    ) -> Result<ReflectResult> {
        let bank = self.store.ensure_bank(bank_id)?;
        let max_steps = options.budget.caps().max_agent_steps;
        let system = self.compose_system_prompt(&bank, options)?;

        let question = options.context.as_ref().map_or_else(
            || query.to_string(),
            |context| format!("{query}\n\nContext: {context}"),
        );
        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(question)];

        let mut result = ReflectResult::default();
        let mut answer: Option<String> = None;

        for step in 1..=max_steps {
            let request = CompletionRequest::from_messages(messages.clone())
                .with_scope("reflect_step")
                .with_max_tokens(2048);
            let action: AgentAction = match complete_structured(self.llm.as_ref(), &request) {
                Ok(action) => action,
                Err(e) => {
                    tracing::warn!(step, "reflect step failed, degrading: {e}");
                    break;
                },
            };

            match action {
                AgentAction::Final { answer: text } => {
                    result.steps.push(AgentStep {
                        step,
                        action: "final".to_string(),
                        tool: None,
                        observation_preview: preview(&text),
                    });
                    answer = Some(text);
                    break;
                },
                AgentAction::Tool { tool, args } => {
                    let observation = self
                        .run_tool(bank_id, &tool, &args, options, &mut result.based_on)
                        .unwrap_or_else(|e| {
                            serde_json::json!({"error": e.to_string()})
                        });
                    let observation_text = observation.to_string();
                    result.steps.push(AgentStep {
                        step,
                        action: "tool".to_string(),
                        tool: Some(tool.clone()),
                        observation_preview: preview(&observation_text),
                    });
                    messages.push(ChatMessage::assistant(
                        serde_json::json!({"action": "tool", "tool": tool, "args": args})
                            .to_string(),
                    ));
                    messages.push(ChatMessage::user(format!(
                        "Observation from {tool}:\n{observation_text}"
                    )));
                },
            }
        }

        let answer = match answer {
            Some(answer) => answer,
            None => {
                result.budget_exhausted = true;
                self.best_effort_answer(&messages)
            },
        };

        if let Some(schema) = &options.response_schema {
            match self.coerce_to_schema(&messages, &answer, schema) {
                Ok(value) => {
                    result.text = value.to_string();
                    result.structured_output = Some(value);
                },
                Err(e) => {
                    // Structured-output failure is fatal for the schema,
                    // not for the call: the raw text comes back instead.
                    tracing::warn!("structured reflect output failed validation: {e}");
                    result.text = answer;
                },
            }
        } else {
            result.text = answer;
        }

        result.based_on.sort();
        result.based_on.dedup();
        Ok(result)
    }

    /// Extracts first-person opinions from a reflect answer. Failures
    /// yield an empty list; opinion extraction is best-effort.
    #[must_use]
    pub fn extract_opinions(&self, query: &str, answer: &str) -> Vec<ExtractedOpinion> {
        let request = CompletionRequest::from_messages(vec![
            ChatMessage::system(
                "Extract any NEW opinions the speaker formed while answering, as \
                 first-person statements (\"I think ...\"), each with a confidence \
                 between 0 and 1. Respond with only JSON: \
                 {\"opinions\": [{\"text\": \"...\", \"confidence\": 0.8}]}. \
                 Return an empty list when the answer contains no opinion.",
            ),
            ChatMessage::user(format!("Question: {query}\n\nAnswer: {answer}")),
        ])
        .with_scope("opinion_extraction")
        .with_max_tokens(1024);

        match complete_structured::<OpinionResponse>(self.llm.as_ref(), &request) {
            Ok(response) => response
                .opinions
                .into_iter()
                .filter(|o| !o.text.trim().is_empty())
                .map(|mut o| {
                    o.confidence = o.confidence.clamp(0.0, 1.0);
                    o
                })
                .collect(),
            Err(e) => {
                tracing::debug!("opinion extraction skipped: {e}");
                Vec::new()
            },
        }
    }

    fn compose_system_prompt(&self, bank: &Bank, options: &ReflectOptions) -> Result<String> {
        let mut sections = Vec::new();

        let name = bank.name.as_deref().unwrap_or(&bank.bank_id);
        let mission = bank.mission.as_deref().unwrap_or("none recorded");
        sections.push(format!(
            "You are the memory and voice of \"{name}\".\nMission: {mission}"
        ));

        let directives = self.store.active_directives(&bank.bank_id, &options.tags)?;
        let mut directive_block = String::from("Directives (mandatory, highest priority first):");
        if directives.is_empty() {
            directive_block.push_str("\n(none)");
        } else {
            for directive in &directives {
                directive_block
                    .push_str(&format!("\n[{}] {}", directive.priority, directive.content));
            }
        }
        sections.push(directive_block);

        sections.push(render_disposition(&bank.disposition));

        sections.push(
            r#"Rules:
- Respond only from retrieved context; cite the facts you rely on.
- Obey the directives above without exception.
- Try search_reflections first, then search_mental_models. Use recall and
  expand to verify claims or drill into details.

At each step respond with only JSON, either
{"action": "tool", "tool": "<name>", "args": {...}} or
{"action": "final", "answer": "..."}.

Tools:
- search_reflections {"query": "..."}  - curated summaries, highest priority
- search_mental_models {"query": "..."}  - consolidated knowledge
- recall {"query": "...", "fact_types": ["world", "experience"]}  - raw memories
- expand {"memory_ids": ["..."], "depth": "chunk"|"document"}  - full text"#
                .to_string(),
        );

        Ok(sections.join("\n\n"))
    }

    fn run_tool(
        &self,
        bank_id: &str,
        tool: &str,
        args: &serde_json::Value,
        options: &ReflectOptions,
        based_on: &mut Vec<UnitId>,
    ) -> Result<serde_json::Value> {
        let query = args.get("query").and_then(|q| q.as_str()).unwrap_or("");
        match tool {
            "search_reflections" => {
                let embedding = self.recall_embed(query)?;
                let hits = self.store.reflections_top_k(
                    bank_id,
                    &embedding,
                    &options.tags,
                    TagMatch::Any,
                    5,
                )?;
                Ok(serde_json::json!({
                    "reflections": hits.iter().map(|(r, score)| serde_json::json!({
                        "id": r.id,
                        "name": r.name,
                        "content": r.content,
                        "score": score,
                    })).collect::<Vec<_>>()
                }))
            },
            "search_mental_models" => {
                let mut recall_options = RecallOptions {
                    fact_types: vec![FactType::MentalModel],
                    tags: options.tags.clone(),
                    budget: options.budget,
                    ..RecallOptions::default()
                };
                recall_options.max_tokens = 2048;
                let found = self.recall.recall(bank_id, query, &recall_options)?;
                based_on.extend(found.results.iter().map(|r| r.unit.id.clone()));
                Ok(serde_json::json!({
                    "mental_models": found.results.iter().map(|r| serde_json::json!({
                        "id": r.unit.id.as_str(),
                        "text": r.unit.text,
                        "proof_count": r.unit.proof_count.unwrap_or(1),
                        "source_memory_ids": r.unit.source_memory_ids,
                    })).collect::<Vec<_>>()
                }))
            },
            "recall" => {
                let fact_types = args
                    .get("fact_types")
                    .and_then(|v| v.as_array())
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_str())
                            .filter_map(FactType::parse)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let recall_options = RecallOptions {
                    fact_types,
                    tags: options.tags.clone(),
                    budget: options.budget,
                    ..RecallOptions::default()
                };
                let found = self.recall.recall(bank_id, query, &recall_options)?;
                based_on.extend(found.results.iter().map(|r| r.unit.id.clone()));
                Ok(serde_json::json!({
                    "memories": found.results.iter().map(|r| serde_json::json!({
                        "id": r.unit.id.as_str(),
                        "text": r.unit.text,
                        "fact_type": r.unit.fact_type.as_str(),
                        "event_date": r.unit.event_date.to_rfc3339(),
                    })).collect::<Vec<_>>()
                }))
            },
            "expand" => {
                let ids: Vec<UnitId> = args
                    .get("memory_ids")
                    .and_then(|v| v.as_array())
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_str())
                            .map(UnitId::from)
                            .collect()
                    })
                    .unwrap_or_default();
                let depth = args.get("depth").and_then(|d| d.as_str()).unwrap_or("chunk");
                let units = self.store.get_units_by_ids(bank_id, &ids)?;
                based_on.extend(units.iter().map(|u| u.id.clone()));

                let mut expanded = Vec::new();
                for unit in &units {
                    let document = if depth == "document" {
                        match &unit.document_id {
                            Some(document_id) => self
                                .store
                                .get_document(bank_id, document_id)?
                                .map(|d| d.original_text),
                            None => None,
                        }
                    } else {
                        None
                    };
                    expanded.push(serde_json::json!({
                        "id": unit.id.as_str(),
                        "text": unit.text,
                        "context": unit.context,
                        "document": document,
                    }));
                }
                Ok(serde_json::json!({"expanded": expanded}))
            },
            other => Err(Error::InvalidInput(format!("unknown tool '{other}'"))),
        }
    }

    fn recall_embed(&self, query: &str) -> Result<Vec<f32>> {
        self.recall.embedder().embed(query)
    }

    fn best_effort_answer(&self, messages: &[ChatMessage]) -> String {
        let mut messages = messages.to_vec();
        messages.push(ChatMessage::user(
            "Step budget exhausted. Answer the original question now from the \
             observations gathered so far, plain text only."
                .to_string(),
        ));
        let request = CompletionRequest::from_messages(messages)
            .with_scope("reflect_final")
            .with_max_tokens(1024);
        self.llm.complete(&request).unwrap_or_else(|e| {
            tracing::warn!("best-effort answer failed: {e}");
            "I could not gather enough context to answer.".to_string()
        })
    }

    /// Validates (and if needed re-prompts for) a schema-constrained final
    /// answer.
    fn coerce_to_schema(
        &self,
        messages: &[ChatMessage],
        answer: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut candidate = answer.to_string();
        let mut last_error = Error::ValidationFailed {
            operation: "reflect_schema".to_string(),
            cause: "no attempts".to_string(),
        };

        for _attempt in 0..=SCHEMA_RETRIES {
            let parsed: std::result::Result<serde_json::Value, _> =
                serde_json::from_str(extract_json_from_response(&candidate));
            match parsed {
                Ok(value) => match validate_against_schema(&value, schema) {
                    Ok(()) => return Ok(value),
                    Err(e) => last_error = e,
                },
                Err(e) => {
                    last_error = Error::ValidationFailed {
                        operation: "reflect_schema".to_string(),
                        cause: e.to_string(),
                    };
                },
            }

            let mut retry_messages = messages.to_vec();
            retry_messages.push(ChatMessage::assistant(candidate.clone()));
            retry_messages.push(ChatMessage::user(format!(
                "Rewrite your answer as JSON validating against this schema \
                 ({last_error}). Schema:\n{schema}\nRespond with only the JSON."
            )));
            let request = CompletionRequest::from_messages(retry_messages)
                .with_scope("reflect_schema")
                .with_max_tokens(2048);
            match self.llm.complete(&request) {
                Ok(next) => candidate = next,
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}

fn render_disposition(disposition: &Disposition) -> String {
    let d = disposition.clamped();
    let strength = if d.bias_strength >= 0.75 {
        "Let these traits strongly color your phrasing."
    } else if d.bias_strength >= 0.4 {
        "Let these traits moderately color your phrasing."
    } else {
        "Let these traits subtly color your phrasing."
    };
    format!(
        "Disposition: {} skepticism, {} literalism, {} empathy. {strength}",
        Disposition::describe(d.skepticism),
        Disposition::describe(d.literalism),
        Disposition::describe(d.empathy),
    )
}

fn preview(text: &str) -> String {
    const MAX: usize = 160;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(MAX).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_disposition_bands() {
        let rendered = render_disposition(&Disposition {
            skepticism: 0.9,
            literalism: 0.1,
            empathy: 0.5,
            bias_strength: 0.9,
        });
        assert!(rendered.contains("high skepticism"));
        assert!(rendered.contains("low literalism"));
        assert!(rendered.contains("strongly"));
    }

    #[test]
    fn test_agent_action_deserialization() {
        let tool: AgentAction = serde_json::from_str(
            r#"{"action": "tool", "tool": "recall", "args": {"query": "x"}}"#,
        )
        .unwrap();
        assert!(matches!(tool, AgentAction::Tool { .. }));

        let final_action: AgentAction =
            serde_json::from_str(r#"{"action": "final", "answer": "done"}"#).unwrap();
        assert!(matches!(final_action, AgentAction::Final { .. }));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(500);
        let p = preview(&long);
        assert!(p.len() < 200);
        assert!(p.ends_with("..."));
    }
}
