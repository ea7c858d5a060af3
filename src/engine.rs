//! The memory engine facade.
//!
//! [`MemoryEngine`] wires the store, embedder, cross-encoder, LLM, and
//! services together and presents the surface external transports consume:
//! bank lifecycle, retain, recall, reflect, reflection/directive/document
//! CRUD, entity lookups, and operation status.

use crate::config::{EngramConfig, TaskMode};
use crate::embedding::Embedder;
use crate::llm::LlmClient;
use crate::models::{
    normalize_tags, Bank, Directive, Disposition, Document, Entity, EntityId, FactType,
    MemoryUnit, Operation, OperationType, RecallOptions, RecallResult, Reflection, RetainItem,
    RetainOptions, UnitId,
};
use crate::rerank::{CrossEncoder, LexicalCrossEncoder};
use crate::services::{
    build_task_backend, ConsolidationEngine, ConsolidationOutcome, EntityResolver, FactExtractor,
    RecallEngine, ReflectAgent, ReflectOptions, ReflectResult, RetainPipeline, TaskBackend,
};
use crate::storage::SqliteStore;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};

/// The top-level engine.
pub struct MemoryEngine {
    store: Arc<SqliteStore>,
    config: EngramConfig,
    embedder: Arc<dyn Embedder>,
    retain_pipeline: Arc<RetainPipeline>,
    recall_engine: Arc<RecallEngine>,
    consolidation: Arc<ConsolidationEngine>,
    reflect_agent: Arc<ReflectAgent>,
    tasks: Arc<dyn TaskBackend>,
}

impl MemoryEngine {
    /// Opens an engine with the default lexical cross-encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or migrated.
    pub fn open(
        config: EngramConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        Self::with_cross_encoder(config, llm, embedder, Arc::new(LexicalCrossEncoder::new()))
    }

    /// Opens an engine with an explicit cross-encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or migrated.
    pub fn with_cross_encoder(
        config: EngramConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn Embedder>,
        cross_encoder: Arc<dyn CrossEncoder>,
    ) -> Result<Self> {
        let store = Arc::new(match &config.db_path {
            Some(path) => SqliteStore::open(path)?,
            None => SqliteStore::open_in_memory()?,
        });

        let resolver = Arc::new(EntityResolver::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&llm),
            config.entity.clone(),
        ));
        let retain_pipeline = Arc::new(RetainPipeline::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            FactExtractor::new(Arc::clone(&llm)),
            Arc::clone(&resolver),
            config.retain.clone(),
        ));
        let recall_engine = Arc::new(RecallEngine::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            cross_encoder,
            Arc::clone(&resolver),
            config.recall.clone(),
        ));
        let consolidation = Arc::new(ConsolidationEngine::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&llm),
            config.consolidation.clone(),
        ));
        let reflect_agent = Arc::new(ReflectAgent::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            Arc::clone(&recall_engine),
        ));
        let tasks = build_task_backend(&config.tasks);

        Ok(Self {
            store,
            config,
            embedder,
            retain_pipeline,
            recall_engine,
            consolidation,
            reflect_agent,
            tasks,
        })
    }

    /// The underlying store, for administrative callers.
    #[must_use]
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Bank lifecycle
    // ------------------------------------------------------------------

    /// Creates (or updates) a bank profile.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or storage fails.
    pub fn create_bank(
        &self,
        bank_id: &str,
        name: Option<String>,
        mission: Option<String>,
        disposition: Option<Disposition>,
    ) -> Result<Bank> {
        let mut bank = self.store.ensure_bank(bank_id)?;
        if name.is_some() {
            bank.name = name;
        }
        if mission.is_some() {
            bank.mission = mission;
        }
        if let Some(disposition) = disposition {
            bank.disposition = disposition.clamped();
        }
        self.store.upsert_bank(&bank)?;
        Ok(bank)
    }

    /// Deletes a bank and everything scoped to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the cascade fails.
    pub fn delete_bank(&self, bank_id: &str) -> Result<bool> {
        self.store.delete_bank(bank_id)
    }

    /// Fetches a bank profile, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get_bank_profile(&self, bank_id: &str) -> Result<Bank> {
        self.store.ensure_bank(bank_id)
    }

    /// Sets the bank mission.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn set_bank_mission(&self, bank_id: &str, mission: &str) -> Result<()> {
        self.store.set_bank_mission(bank_id, mission)
    }

    // ------------------------------------------------------------------
    // Retain
    // ------------------------------------------------------------------

    /// Retains one piece of content. Returns the operation id.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid input; pipeline failures surface on
    /// the operation row (and propagate directly in inline task mode).
    pub fn retain(
        &self,
        bank_id: &str,
        content: impl Into<String>,
        options: RetainOptions,
    ) -> Result<String> {
        let item = RetainItem {
            content: content.into(),
            context: options.context,
            event_date: options.event_date,
            tags: options.tags,
            metadata: options.metadata,
        };
        self.retain_batch(bank_id, vec![item], options.document_id.as_deref(), &[], true)
    }

    /// Retains a batch of items, optionally under a document id with
    /// upsert semantics. Returns the operation id.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid input; pipeline failures surface on
    /// the operation row (and propagate directly in inline task mode).
    pub fn retain_batch(
        &self,
        bank_id: &str,
        items: Vec<RetainItem>,
        document_id: Option<&str>,
        document_tags: &[String],
        upsert: bool,
    ) -> Result<String> {
        if items.is_empty() {
            return Err(Error::InvalidInput("empty retain batch".to_string()));
        }
        if items.iter().any(|item| item.content.trim().is_empty()) {
            return Err(Error::InvalidInput("empty retain content".to_string()));
        }
        let document_tags = normalize_tags(document_tags)?;

        self.store.ensure_bank(bank_id)?;
        let operation_id = self.store.create_operation(bank_id, OperationType::Retain)?;

        let store = Arc::clone(&self.store);
        let pipeline = Arc::clone(&self.retain_pipeline);
        let tasks = Arc::clone(&self.tasks);
        let consolidation = Arc::clone(&self.consolidation);
        let bank = bank_id.to_string();
        let document = document_id.map(ToString::to_string);
        let op_id = operation_id.clone();
        let failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let failure_slot = Arc::clone(&failure);

        self.tasks.submit(
            "retain",
            Box::new(move || {
                let _ = store.start_operation(&op_id);
                let outcome = pipeline.retain_batch(
                    &bank,
                    &items,
                    document.as_deref(),
                    &document_tags,
                    upsert,
                );
                match outcome {
                    Ok(outcome) => {
                        let _ = store.complete_operation(
                            &op_id,
                            &serde_json::json!({
                                "units_created": outcome.units_created,
                                "duplicates": outcome.duplicates,
                                "facts_extracted": outcome.facts_extracted,
                                "links_created": outcome.links_created,
                                "unit_ids": outcome.unit_ids,
                            }),
                        );
                        // Retain completion triggers consolidation.
                        schedule_consolidation(&tasks, &store, &consolidation, &bank);
                    },
                    Err(e) => {
                        let _ = store.fail_operation(&op_id, &e.to_string());
                        let mut slot = failure_slot
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        *slot = Some(e);
                    },
                }
            }),
        )?;

        // Inline mode ran the pipeline on this thread; surface its error.
        if self.config.tasks.mode == TaskMode::Inline {
            let mut slot = failure
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(e) = slot.take() {
                return Err(e);
            }
        }
        Ok(operation_id)
    }

    // ------------------------------------------------------------------
    // Recall and reflect
    // ------------------------------------------------------------------

    /// Recalls memories for a query.
    ///
    /// # Errors
    ///
    /// Returns an error for storage or embedding failures only.
    pub fn recall(
        &self,
        bank_id: &str,
        query: &str,
        options: RecallOptions,
    ) -> Result<RecallResult> {
        self.recall_engine.recall(bank_id, query, &options)
    }

    /// Runs the reflect agent, then schedules extracted opinions for
    /// retention.
    ///
    /// # Errors
    ///
    /// Returns an error for storage failures; tool and LLM failures
    /// degrade the answer instead.
    pub fn reflect(
        &self,
        bank_id: &str,
        query: &str,
        options: ReflectOptions,
    ) -> Result<ReflectResult> {
        let result = self.reflect_agent.reflect(bank_id, query, &options)?;

        if !result.text.is_empty() {
            let opinions = self.reflect_agent.extract_opinions(query, &result.text);
            if !opinions.is_empty() {
                let store = Arc::clone(&self.store);
                let embedder = Arc::clone(&self.embedder);
                let bank = bank_id.to_string();
                self.tasks.submit(
                    "retain_opinions",
                    Box::new(move || {
                        if let Err(e) = retain_opinions(&store, embedder.as_ref(), &bank, &opinions)
                        {
                            tracing::warn!(bank, "opinion retention failed: {e}");
                        }
                    }),
                )?;
            }
        }
        Ok(result)
    }

    /// Runs consolidation for a bank synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error for storage failures outside the per-unit loop.
    pub fn consolidate_now(&self, bank_id: &str) -> Result<ConsolidationOutcome> {
        self.consolidation.run(bank_id)
    }

    // ------------------------------------------------------------------
    // Reflections
    // ------------------------------------------------------------------

    /// Creates a reflection and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, embedding, or storage fails.
    pub fn create_reflection(
        &self,
        bank_id: &str,
        name: &str,
        source_query: &str,
        content: &str,
        tags: &[String],
        reflect_response: Option<serde_json::Value>,
    ) -> Result<Reflection> {
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("empty reflection content".to_string()));
        }
        self.store.ensure_bank(bank_id)?;
        let now = Utc::now();
        let reflection = Reflection {
            id: uuid::Uuid::new_v4().to_string(),
            bank_id: bank_id.to_string(),
            name: name.to_string(),
            source_query: source_query.to_string(),
            content: content.to_string(),
            embedding: self.embedder.embed(content)?,
            reflect_response,
            tags: normalize_tags(tags)?,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_reflection(&reflection)?;
        Ok(reflection)
    }

    /// Fetches a reflection.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get_reflection(&self, bank_id: &str, id: &str) -> Result<Option<Reflection>> {
        self.store.get_reflection(bank_id, id)
    }

    /// Lists a bank's reflections.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn list_reflections(&self, bank_id: &str) -> Result<Vec<Reflection>> {
        self.store.list_reflections(bank_id)
    }

    /// Deletes a reflection.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn delete_reflection(&self, bank_id: &str, id: &str) -> Result<bool> {
        self.store.delete_reflection(bank_id, id)
    }

    // ------------------------------------------------------------------
    // Directives
    // ------------------------------------------------------------------

    /// Creates or updates a directive.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or storage fails.
    pub fn upsert_directive(&self, directive: &Directive) -> Result<()> {
        self.store.ensure_bank(&directive.bank_id)?;
        let directive = Directive {
            tags: normalize_tags(&directive.tags)?,
            ..directive.clone()
        };
        self.store.upsert_directive(&directive)
    }

    /// Fetches a directive.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get_directive(&self, bank_id: &str, id: &str) -> Result<Option<Directive>> {
        self.store.get_directive(bank_id, id)
    }

    /// Lists a bank's directives, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn list_directives(&self, bank_id: &str) -> Result<Vec<Directive>> {
        self.store.list_directives(bank_id)
    }

    /// Deletes a directive.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn delete_directive(&self, bank_id: &str, id: &str) -> Result<bool> {
        self.store.delete_directive(bank_id, id)
    }

    // ------------------------------------------------------------------
    // Documents, entities, operations
    // ------------------------------------------------------------------

    /// Fetches a document.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get_document(&self, bank_id: &str, id: &str) -> Result<Option<Document>> {
        self.store.get_document(bank_id, id)
    }

    /// Lists a bank's documents.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn list_documents(&self, bank_id: &str) -> Result<Vec<Document>> {
        self.store.list_documents(bank_id)
    }

    /// Deletes a document and every unit retained under it.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn delete_document(&self, bank_id: &str, id: &str) -> Result<bool> {
        self.store.delete_units_for_document(bank_id, id)?;
        self.store.delete_document(bank_id, id)
    }

    /// Lists a bank's entities.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn list_entities(&self, bank_id: &str) -> Result<Vec<Entity>> {
        self.store.list_entities(bank_id)
    }

    /// Fetches an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get_entity(&self, bank_id: &str, id: &EntityId) -> Result<Option<Entity>> {
        self.store.get_entity(bank_id, id)
    }

    /// Fetches an operation row.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        self.store.get_operation(id)
    }
}

/// Queues a consolidation run with its own operation row.
fn schedule_consolidation(
    tasks: &Arc<dyn TaskBackend>,
    store: &Arc<SqliteStore>,
    consolidation: &Arc<ConsolidationEngine>,
    bank_id: &str,
) {
    let Ok(op_id) = store.create_operation(bank_id, OperationType::Consolidation) else {
        tracing::warn!(bank_id, "could not create consolidation operation row");
        return;
    };
    let store = Arc::clone(store);
    let consolidation = Arc::clone(consolidation);
    let bank = bank_id.to_string();
    let submitted = tasks.submit(
        "consolidation",
        Box::new(move || {
            let _ = store.start_operation(&op_id);
            match consolidation.run(&bank) {
                Ok(outcome) => {
                    let payload =
                        serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null);
                    let _ = store.complete_operation(&op_id, &payload);
                },
                Err(e) => {
                    let _ = store.fail_operation(&op_id, &e.to_string());
                },
            }
        }),
    );
    if let Err(e) = submitted {
        tracing::warn!(bank_id, "consolidation scheduling failed: {e}");
    }
}

/// Persists opinions extracted after reflect as first-class opinion units.
fn retain_opinions(
    store: &SqliteStore,
    embedder: &dyn Embedder,
    bank_id: &str,
    opinions: &[crate::services::ExtractedOpinion],
) -> Result<()> {
    let texts: Vec<&str> = opinions.iter().map(|o| o.text.as_str()).collect();
    let embeddings = embedder.embed_batch(&texts)?;
    let now = Utc::now();

    let mut units = Vec::new();
    for (opinion, embedding) in opinions.iter().zip(embeddings) {
        // Opinion dedup mirrors retain: skip near-duplicates of the same
        // fact type.
        let duplicate = store
            .vector_top_k(bank_id, &embedding, &[FactType::Opinion], 1, 0.9)?
            .into_iter()
            .next()
            .is_some();
        if duplicate {
            continue;
        }
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(
            "confidence".to_string(),
            format!("{:.2}", opinion.confidence),
        );
        units.push(MemoryUnit {
            id: UnitId::generate(),
            bank_id: bank_id.to_string(),
            text: opinion.text.clone(),
            fact_type: FactType::Opinion,
            context: None,
            created_at: now,
            event_date: now,
            occurred_start: Some(now),
            occurred_end: Some(now),
            mentioned_at: Some(now),
            document_id: None,
            consolidated_at: None,
            embedding,
            tags: Vec::new(),
            metadata,
            proof_count: None,
            source_memory_ids: Vec::new(),
            history: Vec::new(),
        });
    }
    store.insert_units(&units)?;
    Ok(())
}
