//! LLM fact extraction.
//!
//! Turns a chunk of free text into an ordered list of self-contained facts
//! with entities and causal relations. Hitting the model's output cap
//! splits the chunk at its midpoint and recurses on both halves in
//! parallel, concatenating results in order.

use super::chunker::split_at_midpoint;
use crate::llm::{complete_structured, ChatMessage, CompletionRequest, LlmClient};
use crate::models::{ExtractedFact, ExtractionResponse};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Below this size a chunk is never split further; the output-cap error
/// propagates instead.
const MIN_SPLIT_CHARS: usize = 64;

/// Ambient information handed to every extraction call.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    /// Free-text context from the retain call.
    pub context: Option<String>,
    /// The bank mission, which may identify the memory owner by name.
    pub mission: Option<String>,
    /// Reference date for resolving relative temporal expressions.
    pub reference_date: DateTime<Utc>,
}

/// Extracts facts from text chunks through the LLM.
pub struct FactExtractor {
    llm: Arc<dyn LlmClient>,
}

impl FactExtractor {
    /// Creates a new extractor.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Extracts facts from one chunk, splitting recursively on
    /// [`Error::OutputTooLong`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationFailed`] when the model cannot produce
    /// parseable output, or the underlying LLM error.
    pub fn extract(&self, chunk: &str, context: &ExtractionContext) -> Result<Vec<ExtractedFact>> {
        match self.extract_once(chunk, context) {
            Err(Error::OutputTooLong) if chunk.len() >= MIN_SPLIT_CHARS => {
                tracing::debug!(
                    chunk_chars = chunk.len(),
                    "extraction hit output cap, splitting chunk"
                );
                let (head, tail) = split_at_midpoint(chunk);
                let (left, right) = std::thread::scope(|scope| {
                    let left = scope.spawn(|| self.extract(&head, context));
                    let right = scope.spawn(|| self.extract(&tail, context));
                    (
                        left.join().unwrap_or_else(|_| {
                            Err(Error::op("extract_split", "extraction worker panicked"))
                        }),
                        right.join().unwrap_or_else(|_| {
                            Err(Error::op("extract_split", "extraction worker panicked"))
                        }),
                    )
                });
                let mut facts = left?;
                facts.extend(right?);
                Ok(facts)
            },
            other => other,
        }
    }

    fn extract_once(
        &self,
        chunk: &str,
        context: &ExtractionContext,
    ) -> Result<Vec<ExtractedFact>> {
        let request = CompletionRequest::from_messages(vec![
            ChatMessage::system(build_system_prompt(context)),
            ChatMessage::user(chunk.to_string()),
        ])
        .with_scope("extraction")
        .with_max_tokens(8192);

        let mut response: ExtractionResponse = complete_structured(self.llm.as_ref(), &request)?;

        let dropped = response.validate_causal_relations();
        if dropped > 0 {
            tracing::warn!(dropped, "dropped causal relations with invalid targets");
        }
        response.facts.retain(|fact| !fact.text.trim().is_empty());
        Ok(response.facts)
    }
}

fn build_system_prompt(context: &ExtractionContext) -> String {
    let reference = context.reference_date.to_rfc3339();
    let mission = context
        .mission
        .as_deref()
        .unwrap_or("no mission provided");
    let ambient = context
        .context
        .as_deref()
        .unwrap_or("no context provided");

    format!(
        r#"You extract comprehensive, durable facts from text for a long-term memory system.

## CONTEXT
- Current reference date/time: {reference}
- Memory owner profile (mission): {mission}
- Additional context: {ambient}

## RULES
1. Extract FEWER, MORE COMPREHENSIVE facts: each fact is a self-contained
   narrative statement with subject, action, and context, readable without
   the original text. Combine a full discussion or multi-step event into one
   fact rather than fragments.
2. Resolve relative dates (yesterday, last week) against the reference date
   and emit absolute ISO-8601 timestamps in "event_date".
3. If the mission identifies the memory owner by name, facts about what that
   person did, said, or experienced are "experience" and MUST be written in
   FIRST PERSON ("I ..."). The owner's beliefs and judgements are "opinion",
   also first person. Facts about the world or other people are "world",
   written in third person.
4. List the important entities each fact mentions, with entity_type one of
   person, organization, place, product, concept, other.
5. When a fact is caused, enabled, or prevented by an EARLIER fact in your
   list, record it in "causal_relations" with the earlier fact's zero-based
   index and relation_type caused_by, enabled_by, or prevented_by. Never
   reference a later fact; the first fact has no relations.

## OUTPUT
Respond with only JSON:
{{"facts": [{{"text": "...", "event_date": "YYYY-MM-DDTHH:MM:SSZ",
  "fact_type": "world|experience|opinion",
  "entities": [{{"text": "...", "entity_type": "..."}}],
  "causal_relations": [{{"target_fact_index": 0, "relation_type": "caused_by"}}]}}]}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedExtractor {
        calls: AtomicU32,
        too_long_first: bool,
    }

    impl LlmClient for ScriptedExtractor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn complete(&self, request: &CompletionRequest) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.too_long_first && call == 0 {
                return Err(Error::OutputTooLong);
            }
            // Echo one fact per chunk so the split path is observable.
            let chunk = &request.messages.last().unwrap().content;
            let preview: String = chunk.chars().take(12).collect();
            Ok(format!(
                r#"{{"facts": [{{"text": "fact from {preview}", "event_date": null,
                    "fact_type": "world", "entities": [], "causal_relations": []}}]}}"#
            ))
        }
    }

    fn context() -> ExtractionContext {
        ExtractionContext {
            context: None,
            mission: Some("Memories of Marcus".to_string()),
            reference_date: Utc::now(),
        }
    }

    #[test]
    fn test_extract_simple() {
        let extractor = FactExtractor::new(Arc::new(ScriptedExtractor {
            calls: AtomicU32::new(0),
            too_long_first: false,
        }));
        let facts = extractor
            .extract("Marcus won the marathon in 2023.", &context())
            .unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn test_output_too_long_splits_and_concatenates() {
        let extractor = FactExtractor::new(Arc::new(ScriptedExtractor {
            calls: AtomicU32::new(0),
            too_long_first: true,
        }));
        let chunk = format!("{}. {}", "first half ".repeat(20), "second half ".repeat(20));
        let facts = extractor.extract(&chunk, &context()).unwrap();
        // One fact per half after the split.
        assert_eq!(facts.len(), 2);
    }

    #[test]
    fn test_tiny_chunk_propagates_cap_error() {
        struct AlwaysTooLong;
        impl LlmClient for AlwaysTooLong {
            fn name(&self) -> &'static str {
                "toolong"
            }
            fn complete(&self, _request: &CompletionRequest) -> Result<String> {
                Err(Error::OutputTooLong)
            }
        }
        let extractor = FactExtractor::new(Arc::new(AlwaysTooLong));
        let result = extractor.extract("tiny", &context());
        assert!(matches!(result, Err(Error::OutputTooLong)));
    }

    #[test]
    fn test_invalid_causal_relations_dropped() {
        struct BadRelations;
        impl LlmClient for BadRelations {
            fn name(&self) -> &'static str {
                "scripted"
            }
            fn complete(&self, _request: &CompletionRequest) -> Result<String> {
                Ok(r#"{"facts": [
                    {"text": "a", "event_date": null, "fact_type": "world",
                     "entities": [],
                     "causal_relations": [{"target_fact_index": 3, "relation_type": "caused_by"}]},
                    {"text": "b", "event_date": null, "fact_type": "world",
                     "entities": [],
                     "causal_relations": [{"target_fact_index": 0, "relation_type": "caused_by"}]}
                ]}"#
                .to_string())
            }
        }
        let extractor = FactExtractor::new(Arc::new(BadRelations));
        let facts = extractor.extract("text", &context()).unwrap();
        assert!(facts[0].causal_relations.is_empty());
        assert_eq!(facts[1].causal_relations.len(), 1);
    }
}
