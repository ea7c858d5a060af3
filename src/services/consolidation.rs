//! The consolidation engine.
//!
//! Watermark-driven: scans units with `consolidated_at IS NULL` and fact
//! type `experience` or `world`, routes each against the bank's mental
//! models under the tag-scope rules, asks the LLM for update/create/none
//! actions, re-validates them, and applies the survivors. The watermark is
//! written last, so an interrupted run retries the unit.
//!
//! Concurrent runs for the same bank serialize through an in-process
//! advisory lock; contenders return [`ConsolidationOutcome::AlreadyRunning`].

use crate::config::ConsolidationConfig;
use crate::embedding::Embedder;
use crate::llm::{complete_structured, ChatMessage, CompletionRequest, LlmClient};
use crate::models::{
    ConsolidationAction, EntityId, EntityType, FactType, MemoryLink, MemoryUnit, ModelChange,
    UnitId,
};
use crate::storage::SqliteStore;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Result of one consolidation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    /// The watermark scan found nothing to process.
    NoNewMemories,
    /// Mental models are disabled; watermarks untouched.
    Disabled,
    /// Another run holds this bank's advisory lock.
    AlreadyRunning,
    /// The run finished.
    Completed {
        /// Raw units whose watermark was stamped.
        memories_processed: usize,
    },
}

#[derive(Debug, Deserialize)]
struct ConsolidationResponse {
    #[serde(default)]
    actions: Vec<ConsolidationAction>,
}

/// The consolidation engine.
pub struct ConsolidationEngine {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    config: ConsolidationConfig,
    running: Mutex<HashSet<String>>,
}

impl ConsolidationEngine {
    /// Creates a new engine.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            config,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Runs consolidation for one bank.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures outside the per-unit loop; a
    /// failing unit is skipped (watermark left null) and retried on the
    /// next run.
    pub fn run(&self, bank_id: &str) -> Result<ConsolidationOutcome> {
        let Some(_guard) = self.try_lock_bank(bank_id) else {
            tracing::debug!(bank_id, "consolidation already running, skipping");
            return Ok(ConsolidationOutcome::AlreadyRunning);
        };

        let pending = self
            .store
            .unconsolidated_units(bank_id, self.config.batch_limit)?;
        if pending.is_empty() {
            return Ok(ConsolidationOutcome::NoNewMemories);
        }
        if !self.config.enable_mental_models {
            return Ok(ConsolidationOutcome::Disabled);
        }

        let span = tracing::info_span!("consolidation", bank_id, pending = pending.len());
        let _enter = span.enter();

        let mut processed = 0usize;
        // Order is load-bearing: later units may update models created by
        // earlier units in this same run.
        for unit in pending {
            match self.consolidate_unit(bank_id, &unit) {
                Ok(()) => {
                    self.store.mark_consolidated(bank_id, &unit.id, Utc::now())?;
                    processed += 1;
                },
                Err(e) => {
                    tracing::warn!(
                        unit = %unit.id,
                        "consolidation failed for unit, will retry on next run: {e}"
                    );
                    metrics::counter!("consolidation_unit_failures_total").increment(1);
                },
            }
        }

        metrics::counter!("consolidation_units_processed_total").increment(processed as u64);
        Ok(ConsolidationOutcome::Completed {
            memories_processed: processed,
        })
    }

    fn consolidate_unit(&self, bank_id: &str, unit: &MemoryUnit) -> Result<()> {
        let candidates = self.candidate_models(bank_id, unit)?;
        let actions = self.propose_actions(unit, &candidates)?;
        let unit_persons = self.person_entities(bank_id, std::slice::from_ref(&unit.id))?;

        for action in actions {
            match action {
                ConsolidationAction::None => {},
                ConsolidationAction::Update { model_id, summary } => {
                    let Some(model) = candidates
                        .iter()
                        .find(|m| m.id.as_str() == model_id)
                        .cloned()
                    else {
                        tracing::warn!(model_id, "update action names unknown model, skipping");
                        continue;
                    };
                    match self.validate_update(bank_id, unit, &model, &unit_persons)? {
                        UpdateRoute::Allowed => {
                            self.apply_update(bank_id, unit, model, summary)?;
                        },
                        UpdateRoute::CrossScope => {
                            // A merge across disjoint scopes becomes a new
                            // untagged model instead.
                            self.apply_create(bank_id, unit, None, summary, Vec::new())?;
                        },
                        UpdateRoute::Vetoed => {
                            tracing::debug!(
                                model = %model.id,
                                "different-person veto blocked model update"
                            );
                        },
                    }
                },
                ConsolidationAction::Create {
                    name,
                    summary,
                    tags,
                } => {
                    // New models take the unit's scope unless the proposal
                    // matches it exactly.
                    let unit_tags: HashSet<&String> = unit.tags.iter().collect();
                    let proposed: HashSet<&String> = tags.iter().collect();
                    let tags = if proposed == unit_tags {
                        tags
                    } else {
                        unit.tags.clone()
                    };
                    self.apply_create(bank_id, unit, Some(name), summary, tags)?;
                },
            }
        }
        Ok(())
    }

    /// Candidate set: tag-compatible mental models plus ANN neighbors by
    /// embedding similarity.
    fn candidate_models(&self, bank_id: &str, unit: &MemoryUnit) -> Result<Vec<MemoryUnit>> {
        let all_models = self.store.mental_models(bank_id)?;
        let mut chosen: Vec<MemoryUnit> = all_models
            .iter()
            .filter(|model| tags_compatible(&unit.tags, &model.tags))
            .cloned()
            .collect();

        let ann = self.store.vector_top_k(
            bank_id,
            &unit.embedding,
            &[FactType::MentalModel],
            self.config.candidate_k,
            0.0,
        )?;
        for (id, _) in ann {
            if !chosen.iter().any(|m| m.id == id) {
                if let Some(model) = all_models.iter().find(|m| m.id == id) {
                    chosen.push(model.clone());
                }
            }
        }
        Ok(chosen)
    }

    fn propose_actions(
        &self,
        unit: &MemoryUnit,
        candidates: &[MemoryUnit],
    ) -> Result<Vec<ConsolidationAction>> {
        let candidate_lines: Vec<String> = candidates
            .iter()
            .map(|model| {
                format!(
                    "- model_id={} tags={:?} proof_count={} summary=\"{}\"",
                    model.id,
                    model.tags,
                    model.proof_count.unwrap_or(1),
                    model.text
                )
            })
            .collect();
        let candidate_block = if candidate_lines.is_empty() {
            "(no existing mental models)".to_string()
        } else {
            candidate_lines.join("\n")
        };

        let request = CompletionRequest::from_messages(vec![
            ChatMessage::system(
                r#"You maintain consolidated "mental models" for a memory system.
Given a new raw fact and the existing candidate models, decide for the fact:
- UPDATE an existing model when the fact refines, contradicts, or extends it.
  Emit the model's full replacement summary.
- CREATE a new model when nothing fits. Give it a short name and summary.
- NONE when the fact is noise.

Rules:
- A model summarizes ONE coherent subject; never merge facts about two
  different people into one model.
- Keep summaries short, current, and written as standing knowledge
  ("X lives in Y"), not event logs.

Respond with only JSON:
{"actions": [
  {"action": "update", "model_id": "...", "summary": "..."} |
  {"action": "create", "name": "...", "summary": "...", "tags": ["..."]} |
  {"action": "none"}
]}"#,
            ),
            ChatMessage::user(format!(
                "New fact (tags {:?}): {}\n\nCandidate models:\n{candidate_block}",
                unit.tags, unit.text
            )),
        ])
        .with_scope("consolidation")
        .with_max_tokens(2048);

        let response: ConsolidationResponse = complete_structured(self.llm.as_ref(), &request)?;
        Ok(response.actions)
    }

    fn validate_update(
        &self,
        bank_id: &str,
        unit: &MemoryUnit,
        model: &MemoryUnit,
        unit_persons: &HashSet<EntityId>,
    ) -> Result<UpdateRoute> {
        // Different-person veto: two units about different people must
        // never merge into one model.
        if !unit_persons.is_empty() {
            let model_persons = self.person_entities(
                bank_id,
                &model
                    .source_memory_ids
                    .iter()
                    .cloned()
                    .chain(std::iter::once(model.id.clone()))
                    .collect::<Vec<_>>(),
            )?;
            if !model_persons.is_empty() && unit_persons.is_disjoint(&model_persons) {
                return Ok(UpdateRoute::Vetoed);
            }
        }

        if tags_compatible(&unit.tags, &model.tags) {
            Ok(UpdateRoute::Allowed)
        } else {
            Ok(UpdateRoute::CrossScope)
        }
    }

    fn apply_update(
        &self,
        bank_id: &str,
        unit: &MemoryUnit,
        mut model: MemoryUnit,
        summary: String,
    ) -> Result<()> {
        let before_text = model.text.clone();
        model.history.push(ModelChange {
            timestamp: Utc::now(),
            before_text,
            after_text: summary.clone(),
            trigger_unit_id: unit.id.clone(),
        });
        model.text = summary;
        model.embedding = self.embedder.embed(&model.text)?;
        model.proof_count = Some(model.proof_count.unwrap_or(1) + 1);
        if !model.source_memory_ids.contains(&unit.id) {
            model.source_memory_ids.push(unit.id.clone());
        }
        self.store.update_mental_model(&model)?;
        self.link_model_to_source(bank_id, &model.id, &unit.id)?;
        self.inherit_entities(bank_id, unit, &model.id)?;
        tracing::info!(model = %model.id, trigger = %unit.id, "mental model updated");
        Ok(())
    }

    fn apply_create(
        &self,
        bank_id: &str,
        unit: &MemoryUnit,
        name: Option<String>,
        summary: String,
        tags: Vec<String>,
    ) -> Result<()> {
        let mut metadata = std::collections::BTreeMap::new();
        if let Some(name) = name {
            metadata.insert("name".to_string(), name);
        }
        let embedding = self.embedder.embed(&summary)?;
        let model = MemoryUnit {
            id: UnitId::generate(),
            bank_id: bank_id.to_string(),
            text: summary,
            fact_type: FactType::MentalModel,
            context: None,
            created_at: Utc::now(),
            // Temporal recall depends on models inheriting the triggering
            // source's dates, not "now".
            event_date: unit.event_date,
            occurred_start: unit.occurred_start.or(Some(unit.event_date)),
            occurred_end: unit.occurred_end,
            mentioned_at: unit.mentioned_at,
            document_id: None,
            consolidated_at: Some(Utc::now()),
            embedding,
            tags,
            metadata,
            proof_count: Some(1),
            source_memory_ids: vec![unit.id.clone()],
            history: Vec::new(),
        };
        self.store.insert_units(std::slice::from_ref(&model))?;
        self.link_model_to_source(bank_id, &model.id, &unit.id)?;
        self.inherit_entities(bank_id, unit, &model.id)?;
        tracing::info!(model = %model.id, trigger = %unit.id, "mental model created");
        Ok(())
    }

    /// Bidirectional semantic links between a model and one of its source
    /// units.
    fn link_model_to_source(
        &self,
        bank_id: &str,
        model_id: &UnitId,
        source_id: &UnitId,
    ) -> Result<()> {
        self.store.upsert_links(
            bank_id,
            &[
                MemoryLink::semantic(model_id.clone(), source_id.clone(), 1.0),
                MemoryLink::semantic(source_id.clone(), model_id.clone(), 1.0),
            ],
        )
    }

    /// The model mentions whatever its trigger unit mentions.
    fn inherit_entities(
        &self,
        bank_id: &str,
        unit: &MemoryUnit,
        model_id: &UnitId,
    ) -> Result<()> {
        let pairs: Vec<(UnitId, EntityId)> = self
            .store
            .entities_for_units(bank_id, std::slice::from_ref(&unit.id))?
            .into_iter()
            .map(|(_, entity)| (model_id.clone(), entity.id))
            .collect();
        self.store.link_units_to_entities(&pairs)
    }

    fn person_entities(
        &self,
        bank_id: &str,
        unit_ids: &[UnitId],
    ) -> Result<HashSet<EntityId>> {
        Ok(self
            .store
            .entities_for_units(bank_id, unit_ids)?
            .into_iter()
            .filter(|(_, entity)| entity.entity_type == EntityType::Person)
            .map(|(_, entity)| entity.id)
            .collect())
    }

    fn try_lock_bank(&self, bank_id: &str) -> Option<BankLockGuard<'_>> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if running.insert(bank_id.to_string()) {
            Some(BankLockGuard {
                engine: self,
                bank_id: bank_id.to_string(),
            })
        } else {
            None
        }
    }
}

enum UpdateRoute {
    Allowed,
    CrossScope,
    Vetoed,
}

/// RAII guard for the per-bank advisory lock.
struct BankLockGuard<'a> {
    engine: &'a ConsolidationEngine,
    bank_id: String,
}

impl Drop for BankLockGuard<'_> {
    fn drop(&mut self) {
        let mut running = self
            .engine
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        running.remove(&self.bank_id);
    }
}

/// Tag-scope routing: same scope, unit-scoped-model-global, and
/// unit-global-model-scoped all allow UPDATE. Two different non-empty,
/// non-overlapping scopes do not.
fn tags_compatible(unit_tags: &[String], model_tags: &[String]) -> bool {
    if unit_tags.is_empty() || model_tags.is_empty() {
        return true;
    }
    let unit: HashSet<&String> = unit_tags.iter().collect();
    let model: HashSet<&String> = model_tags.iter().collect();
    unit == model || !unit.is_disjoint(&model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_tags_compatible_same_scope() {
        assert!(tags_compatible(&tags(&["a"]), &tags(&["a"])));
    }

    #[test]
    fn test_tags_compatible_global_absorbs() {
        assert!(tags_compatible(&tags(&["a"]), &[]));
        assert!(tags_compatible(&[], &tags(&["a"])));
        assert!(tags_compatible(&[], &[]));
    }

    #[test]
    fn test_tags_incompatible_disjoint_scopes() {
        assert!(!tags_compatible(&tags(&["a"]), &tags(&["b"])));
    }

    #[test]
    fn test_tags_compatible_overlapping_scopes() {
        assert!(tags_compatible(&tags(&["a", "b"]), &tags(&["b", "c"])));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ConsolidationOutcome::Completed {
            memories_processed: 4,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["memories_processed"], 4);

        let outcome = ConsolidationOutcome::NoNewMemories;
        assert_eq!(
            serde_json::to_value(&outcome).unwrap()["status"],
            "no_new_memories"
        );
    }
}
