//! The retain pipeline.
//!
//! content -> chunking -> LLM fact extraction -> entity resolution ->
//! embedding -> deduplication -> insertion -> link synthesis.
//!
//! Extraction failures for one chunk are isolated: other chunks still
//! persist. Fatal storage conditions propagate to the caller, who records
//! them on the owning operation row.

use super::chunker::chunk_text;
use super::dedup::DedupChecker;
use super::entity_resolver::EntityResolver;
use super::extraction::{ExtractionContext, FactExtractor};
use super::links::LinkSynthesizer;
use crate::config::RetainConfig;
use crate::embedding::Embedder;
use crate::models::{
    normalize_tags, Document, EntityId, ExtractedFact, FactType, MemoryUnit, RetainItem, UnitId,
};
use crate::storage::vector::cosine_similarity;
use crate::storage::SqliteStore;
use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Result of one retain batch.
#[derive(Debug, Clone, Default)]
pub struct RetainOutcome {
    /// Canonical unit ids per retained fact, in extraction order.
    /// Deduplicated facts map to the existing unit's id.
    pub unit_ids: Vec<UnitId>,
    /// Units actually inserted.
    pub units_created: usize,
    /// Facts that matched an existing unit at or above the dedup
    /// threshold.
    pub duplicates: usize,
    /// Facts produced by extraction before deduplication.
    pub facts_extracted: usize,
    /// Graph edges written by link synthesis.
    pub links_created: usize,
}

#[derive(Debug, Serialize)]
struct CausalMetadata<'a> {
    target_unit_id: &'a str,
    relation_type: crate::models::CausalRelationType,
}

/// One extracted fact staged for persistence.
struct StagedFact {
    item_index: usize,
    chunk_index: usize,
    fact_index: usize,
    fact: ExtractedFact,
    embedding: Vec<f32>,
}

/// The retain pipeline.
pub struct RetainPipeline {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    extractor: FactExtractor,
    resolver: Arc<EntityResolver>,
    dedup: DedupChecker,
    links: LinkSynthesizer,
    config: RetainConfig,
}

impl RetainPipeline {
    /// Creates a new pipeline.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        extractor: FactExtractor,
        resolver: Arc<EntityResolver>,
        config: RetainConfig,
    ) -> Self {
        let dedup = DedupChecker::new(Arc::clone(&store), config.dedup_threshold);
        let links = LinkSynthesizer::new(Arc::clone(&store), config.clone());
        Self {
            store,
            embedder,
            extractor,
            resolver,
            dedup,
            links,
            config,
        }
    }

    /// Runs the pipeline for a batch of items.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for an empty batch, empty content, or
    ///   invalid tags
    /// - Storage errors, which abort the batch
    pub fn retain_batch(
        &self,
        bank_id: &str,
        items: &[RetainItem],
        document_id: Option<&str>,
        document_tags: &[String],
        upsert: bool,
    ) -> Result<RetainOutcome> {
        if items.is_empty() {
            return Err(Error::InvalidInput("empty retain batch".to_string()));
        }
        for item in items {
            if item.content.trim().is_empty() {
                return Err(Error::InvalidInput("empty retain content".to_string()));
            }
        }
        let document_tags = normalize_tags(document_tags)?;

        let bank = self.store.ensure_bank(bank_id)?;
        let now = Utc::now();

        // Stage 1: document upsert replaces the document's prior units.
        if let Some(document_id) = document_id {
            if upsert && self.store.get_document(bank_id, document_id)?.is_some() {
                let removed = self
                    .store
                    .delete_units_for_document(bank_id, document_id)?;
                tracing::info!(
                    bank_id,
                    document_id,
                    replaced = removed.len(),
                    "document upsert replaced prior units"
                );
            }
            let original_text: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
            self.store.upsert_document(&Document {
                id: document_id.to_string(),
                bank_id: bank_id.to_string(),
                original_text: original_text.join("\n\n"),
                metadata: items
                    .first()
                    .map(|i| i.metadata.clone())
                    .unwrap_or_default(),
                created_at: now,
                updated_at: now,
            })?;
        }

        // Stages 2-3: chunk and extract, chunks in parallel waves.
        let staged = self.extract_all(&bank.mission, items, now)?;
        let facts_extracted = staged.len();

        // Stage 4: embed all fact texts in one batch.
        let staged = self.embed_facts(staged)?;

        // Stages 5-6: dedup against the store and within the batch, then
        // insert survivors.
        let (units, entities_per_unit, unit_ids, duplicates) =
            self.dedup_and_build(bank_id, items, &document_tags, document_id, staged, now)?;

        self.store.insert_units(&units)?;
        let mut entity_pairs: Vec<(UnitId, EntityId)> = Vec::new();
        for (unit, entity_ids) in units.iter().zip(&entities_per_unit) {
            for entity_id in entity_ids {
                entity_pairs.push((unit.id.clone(), entity_id.clone()));
            }
        }
        self.store.link_units_to_entities(&entity_pairs)?;

        // Stage 7: link synthesis.
        let links_created = self.links.synthesize(bank_id, &units, &entities_per_unit)?;

        metrics::counter!("retain_units_created_total").increment(units.len() as u64);
        metrics::counter!("retain_duplicates_total").increment(duplicates as u64);

        Ok(RetainOutcome {
            unit_ids,
            units_created: units.len(),
            duplicates,
            facts_extracted,
            links_created,
        })
    }

    /// Chunks every item and extracts facts, `max_parallel_chunks` at a
    /// time. A failing chunk is logged and skipped.
    fn extract_all(
        &self,
        mission: &Option<String>,
        items: &[RetainItem],
        now: DateTime<Utc>,
    ) -> Result<Vec<StagedFact>> {
        let mut work: Vec<(usize, usize, String, ExtractionContext)> = Vec::new();
        for (item_index, item) in items.iter().enumerate() {
            let context = ExtractionContext {
                context: item.context.clone(),
                mission: mission.clone(),
                reference_date: item.event_date.unwrap_or(now),
            };
            for (chunk_index, chunk) in chunk_text(&item.content, self.config.chunk_max_chars)
                .into_iter()
                .enumerate()
            {
                work.push((item_index, chunk_index, chunk, context.clone()));
            }
        }

        let mut staged = Vec::new();
        for wave in work.chunks(self.config.max_parallel_chunks.max(1)) {
            let results: Vec<Result<Vec<ExtractedFact>>> = std::thread::scope(|scope| {
                let handles: Vec<_> = wave
                    .iter()
                    .map(|(_, _, chunk, context)| {
                        scope.spawn(move || self.extractor.extract(chunk, context))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(Error::op("extract_chunk", "extraction worker panicked"))
                        })
                    })
                    .collect()
            });

            for ((item_index, chunk_index, chunk, _), result) in wave.iter().zip(results) {
                match result {
                    Ok(facts) => {
                        for (fact_index, fact) in facts.into_iter().enumerate() {
                            staged.push(StagedFact {
                                item_index: *item_index,
                                chunk_index: *chunk_index,
                                fact_index,
                                fact,
                                embedding: Vec::new(),
                            });
                        }
                    },
                    // Chunk isolation: one bad chunk never sinks the batch.
                    Err(e) => {
                        tracing::warn!(
                            item = item_index,
                            chunk = chunk_index,
                            chunk_chars = chunk.len(),
                            "chunk extraction failed, skipping: {e}"
                        );
                        metrics::counter!("retain_chunks_failed_total").increment(1);
                    },
                }
            }
        }
        Ok(staged)
    }

    fn embed_facts(&self, mut staged: Vec<StagedFact>) -> Result<Vec<StagedFact>> {
        if staged.is_empty() {
            return Ok(staged);
        }
        let texts: Vec<&str> = staged.iter().map(|s| s.fact.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts)?;
        for (fact, embedding) in staged.iter_mut().zip(embeddings) {
            fact.embedding = embedding;
        }
        Ok(staged)
    }

    /// Deduplicates staged facts and builds unit rows for the survivors.
    #[allow(clippy::type_complexity)]
    fn dedup_and_build(
        &self,
        bank_id: &str,
        items: &[RetainItem],
        document_tags: &[String],
        document_id: Option<&str>,
        staged: Vec<StagedFact>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MemoryUnit>, Vec<Vec<EntityId>>, Vec<UnitId>, usize)> {
        let mut units: Vec<MemoryUnit> = Vec::new();
        let mut entities_per_unit: Vec<Vec<EntityId>> = Vec::new();
        let mut canonical_ids: Vec<UnitId> = Vec::with_capacity(staged.len());
        let mut duplicates = 0usize;
        // (item, chunk, fact_index) -> canonical id, for causal mapping.
        let mut canonical_by_position: std::collections::HashMap<(usize, usize, usize), UnitId> =
            std::collections::HashMap::new();

        for (offset, staged_fact) in staged.iter().enumerate() {
            let StagedFact {
                item_index,
                chunk_index,
                fact_index,
                fact,
                embedding,
            } = staged_fact;
            let item = &items[*item_index];
            let fact_type = FactType::parse(&fact.fact_type).unwrap_or(FactType::Observation);

            // Dedup against the store.
            if let Some((existing, similarity)) =
                self.dedup.check(bank_id, fact_type, embedding)?
            {
                tracing::debug!(
                    similarity,
                    existing = %existing,
                    "fact deduplicated against existing unit"
                );
                duplicates += 1;
                canonical_by_position
                    .insert((*item_index, *chunk_index, *fact_index), existing.clone());
                canonical_ids.push(existing);
                continue;
            }

            // Dedup within the batch.
            if let Some(previous) = units.iter().find(|u| {
                u.fact_type == fact_type
                    && cosine_similarity(&u.embedding, embedding) >= self.config.dedup_threshold
            }) {
                duplicates += 1;
                canonical_by_position
                    .insert((*item_index, *chunk_index, *fact_index), previous.id.clone());
                canonical_ids.push(previous.id.clone());
                continue;
            }

            let reference = item.event_date.unwrap_or(now);
            let event_date = fact
                .event_date
                .as_deref()
                .and_then(parse_event_date)
                .unwrap_or(reference);

            let mut tags = item.tags.clone();
            tags.extend(document_tags.iter().cloned());
            let tags = normalize_tags(&tags)?;

            let mut metadata = item.metadata.clone();
            let causal: Vec<CausalMetadata<'_>> = fact
                .causal_relations
                .iter()
                .filter_map(|relation| {
                    let target = usize::try_from(relation.target_fact_index).ok()?;
                    let canonical =
                        canonical_by_position.get(&(*item_index, *chunk_index, target))?;
                    Some(CausalMetadata {
                        target_unit_id: canonical.as_str(),
                        relation_type: relation.relation_type,
                    })
                })
                .collect();
            if !causal.is_empty() {
                metadata.insert(
                    "causal_relations".to_string(),
                    serde_json::to_string(&causal)
                        .map_err(|e| Error::op("serialize_causal_relations", e))?,
                );
            }

            // Batch-stable creation order survives `created_at` sorts.
            let unit = MemoryUnit {
                id: UnitId::generate(),
                bank_id: bank_id.to_string(),
                text: fact.text.clone(),
                fact_type,
                context: item.context.clone(),
                created_at: now + Duration::microseconds(i64::try_from(offset).unwrap_or(0)),
                event_date,
                occurred_start: Some(event_date),
                occurred_end: Some(event_date),
                mentioned_at: Some(reference),
                document_id: document_id.map(ToString::to_string),
                consolidated_at: None,
                embedding: embedding.clone(),
                tags,
                metadata,
                proof_count: None,
                source_memory_ids: Vec::new(),
                history: Vec::new(),
            };

            let entity_ids =
                self.resolver
                    .resolve_batch(bank_id, &fact.entities, item.context.as_deref())?;

            canonical_by_position
                .insert((*item_index, *chunk_index, *fact_index), unit.id.clone());
            canonical_ids.push(unit.id.clone());
            entities_per_unit.push(entity_ids);
            units.push(unit);
        }

        Ok((units, entities_per_unit, canonical_ids, duplicates))
    }
}

/// Parses an extraction-produced event date: RFC 3339 first, then a
/// zoneless timestamp (treated as UTC), then a bare date.
fn parse_event_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(DateTime::from_naive_utc_and_offset(
            date.and_hms_opt(0, 0, 0)?,
            Utc,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_date_formats() {
        assert!(parse_event_date("2024-06-15T10:00:00Z").is_some());
        // A missing timezone is treated as UTC.
        assert_eq!(
            parse_event_date("2024-06-15T10:00:00").map(|d| d.to_rfc3339()),
            Some("2024-06-15T10:00:00+00:00".to_string())
        );
        assert_eq!(
            parse_event_date("2023-01-05").map(|d| d.to_rfc3339()),
            Some("2023-01-05T00:00:00+00:00".to_string())
        );
        assert!(parse_event_date("sometime in June").is_none());
    }
}
