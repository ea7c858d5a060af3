//! Entity resolution.
//!
//! Deduplicates extracted entity mentions against a bank's existing
//! entities: exact normalized match first, then embedding similarity, with
//! an LLM consult when several candidates sit inside the ambiguity band.
//! A per-process LRU caches `(bank, normalized, type)` resolutions.

use crate::config::EntityConfig;
use crate::embedding::Embedder;
use crate::llm::{complete_structured, ChatMessage, CompletionRequest, LlmClient};
use crate::models::{normalize_name, Entity, EntityId, EntityMention, EntityType};
use crate::storage::SqliteStore;
use crate::Result;
use chrono::Utc;
use lru::LruCache;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

type CacheKey = (String, String, EntityType);

/// Resolves entity mentions to canonical entities within a bank.
pub struct EntityResolver {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    config: EntityConfig,
    cache: Mutex<LruCache<CacheKey, EntityId>>,
}

#[derive(Debug, Deserialize)]
struct DisambiguationChoice {
    entity_id: Option<String>,
}

impl EntityResolver {
    /// Creates a new resolver.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        config: EntityConfig,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            embedder,
            llm,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolves a batch of mentions, preserving input order. New entities
    /// are created for mentions that match nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or embedding fails.
    pub fn resolve_batch(
        &self,
        bank_id: &str,
        mentions: &[EntityMention],
        context: Option<&str>,
    ) -> Result<Vec<EntityId>> {
        if mentions.is_empty() {
            return Ok(Vec::new());
        }

        // One resolution per distinct (normalized, type) pair.
        let mut distinct: Vec<(String, EntityType, String)> = Vec::new();
        let mut mention_keys: Vec<usize> = Vec::with_capacity(mentions.len());
        let mut index_of: HashMap<(String, EntityType), usize> = HashMap::new();
        for mention in mentions {
            let normalized = normalize_name(&mention.text);
            let key = (normalized.clone(), mention.entity_type);
            let index = *index_of.entry(key).or_insert_with(|| {
                distinct.push((normalized, mention.entity_type, mention.text.clone()));
                distinct.len() - 1
            });
            mention_keys.push(index);
        }

        let mut resolved: Vec<Option<EntityId>> = vec![None; distinct.len()];

        // Cache and exact-match pass.
        let mut unresolved: Vec<usize> = Vec::new();
        for (index, (normalized, entity_type, _)) in distinct.iter().enumerate() {
            if let Some(id) = self.cache_get(bank_id, normalized, *entity_type) {
                resolved[index] = Some(id);
                continue;
            }
            if let Some(entity) =
                self.store
                    .find_entity_normalized(bank_id, normalized, *entity_type)?
            {
                self.cache_put(bank_id, normalized, *entity_type, entity.id.clone());
                resolved[index] = Some(entity.id);
                continue;
            }
            unresolved.push(index);
        }

        // Embedding pass for the rest.
        if !unresolved.is_empty() {
            let texts: Vec<&str> = unresolved
                .iter()
                .map(|&i| distinct[i].2.as_str())
                .collect();
            let embeddings = self.embedder.embed_batch(&texts)?;

            for (position, &index) in unresolved.iter().enumerate() {
                let (normalized, entity_type, surface) = &distinct[index];
                let embedding = &embeddings[position];
                let id = self.resolve_one(
                    bank_id,
                    surface,
                    normalized,
                    *entity_type,
                    embedding,
                    context,
                    mentions,
                )?;
                self.cache_put(bank_id, normalized, *entity_type, id.clone());
                resolved[index] = Some(id);
            }
        }

        Ok(mention_keys
            .into_iter()
            .filter_map(|index| resolved[index].clone())
            .collect())
    }

    /// Lookup-only resolution for query tokens: exact normalized matches,
    /// no inserts. Used by the recall entity signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn lookup_query_entities(&self, bank_id: &str, query: &str) -> Result<Vec<EntityId>> {
        let mut found = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let tokens: Vec<&str> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .collect();

        // Single tokens plus adjacent bigrams ("New York").
        let mut candidates: Vec<String> = tokens.iter().map(|t| normalize_name(t)).collect();
        for pair in tokens.windows(2) {
            candidates.push(normalize_name(&format!("{} {}", pair[0], pair[1])));
        }

        for normalized in candidates {
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            for entity in self.store.find_entities_by_normalized(bank_id, &normalized)? {
                if seen.insert(entity.id.as_str().to_string()) {
                    found.push(entity.id);
                }
            }
        }
        Ok(found)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_one(
        &self,
        bank_id: &str,
        surface: &str,
        normalized: &str,
        entity_type: EntityType,
        embedding: &[f32],
        context: Option<&str>,
        nearby: &[EntityMention],
    ) -> Result<EntityId> {
        let candidates = self.store.entities_top_k(
            bank_id,
            embedding,
            entity_type,
            self.config.candidate_k,
            self.config.accept_threshold - self.config.ambiguity_band,
        )?;

        if let Some((best, best_similarity)) = candidates.first() {
            if *best_similarity >= self.config.accept_threshold {
                // Multiple candidates inside the band around the best score
                // make the choice ambiguous.
                let ambiguous = candidates
                    .iter()
                    .filter(|(_, s)| best_similarity - s <= self.config.ambiguity_band)
                    .count()
                    > 1;
                if ambiguous {
                    if let Some(chosen) =
                        self.disambiguate(surface, context, nearby, &candidates)
                    {
                        return Ok(chosen);
                    }
                }
                return Ok(best.id.clone());
            }
        }

        // No acceptable candidate: create a new entity. A concurrent create
        // of the same name collapses onto the existing row.
        let entity = Entity {
            id: EntityId::generate(),
            bank_id: bank_id.to_string(),
            canonical_name: surface.to_string(),
            normalized_name: normalized.to_string(),
            entity_type,
            embedding: embedding.to_vec(),
            aliases: Vec::new(),
            created_at: Utc::now(),
        };
        let stored = self.store.insert_entity(&entity)?;
        Ok(stored.id)
    }

    fn disambiguate(
        &self,
        surface: &str,
        context: Option<&str>,
        nearby: &[EntityMention],
        candidates: &[(Entity, f32)],
    ) -> Option<EntityId> {
        let candidate_lines: Vec<String> = candidates
            .iter()
            .map(|(entity, similarity)| {
                format!(
                    "- id={} name=\"{}\" type={} similarity={similarity:.2}",
                    entity.id, entity.canonical_name, entity.entity_type
                )
            })
            .collect();
        let nearby_names: Vec<&str> = nearby.iter().map(|m| m.text.as_str()).collect();

        let request = CompletionRequest::from_messages(vec![
            ChatMessage::system(
                "You disambiguate entity mentions. Given a mention, its context, and \
                 candidate entities, answer with only JSON: {\"entity_id\": \"<id>\"} for \
                 the matching candidate, or {\"entity_id\": null} if none match.",
            ),
            ChatMessage::user(format!(
                "Mention: \"{surface}\"\nContext: {}\nNearby mentions: {}\nCandidates:\n{}",
                context.unwrap_or("none"),
                nearby_names.join(", "),
                candidate_lines.join("\n"),
            )),
        ])
        .with_scope("entity_disambiguation")
        .with_max_tokens(128);

        let choice: DisambiguationChoice =
            complete_structured(self.llm.as_ref(), &request).ok()?;
        let chosen = choice.entity_id?;
        candidates
            .iter()
            .find(|(entity, _)| entity.id.as_str() == chosen)
            .map(|(entity, _)| entity.id.clone())
    }

    fn cache_get(
        &self,
        bank_id: &str,
        normalized: &str,
        entity_type: EntityType,
    ) -> Option<EntityId> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache
            .get(&(bank_id.to_string(), normalized.to_string(), entity_type))
            .cloned()
    }

    fn cache_put(
        &self,
        bank_id: &str,
        normalized: &str,
        entity_type: EntityType,
        id: EntityId,
    ) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.put(
            (bank_id.to_string(), normalized.to_string(), entity_type),
            id,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::Error;

    struct NoLlm;
    impl LlmClient for NoLlm {
        fn name(&self) -> &'static str {
            "none"
        }
        fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            Err(Error::op("llm", "not available in this test"))
        }
    }

    fn resolver() -> (Arc<SqliteStore>, EntityResolver) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.ensure_bank("b1").unwrap();
        let resolver = EntityResolver::new(
            Arc::clone(&store),
            Arc::new(HashEmbedder::new()),
            Arc::new(NoLlm),
            EntityConfig::default(),
        );
        (store, resolver)
    }

    fn mention(text: &str, entity_type: EntityType) -> EntityMention {
        EntityMention {
            text: text.to_string(),
            entity_type,
        }
    }

    #[test]
    fn test_resolve_creates_then_reuses() {
        let (_, resolver) = resolver();
        let first = resolver
            .resolve_batch("b1", &[mention("Nicolò", EntityType::Person)], None)
            .unwrap();
        let second = resolver
            .resolve_batch("b1", &[mention("nicolò", EntityType::Person)], None)
            .unwrap();
        assert_eq!(first[0], second[0]);
    }

    #[test]
    fn test_resolve_preserves_order_and_duplicates() {
        let (_, resolver) = resolver();
        let ids = resolver
            .resolve_batch(
                "b1",
                &[
                    mention("John", EntityType::Person),
                    mention("Boston", EntityType::Place),
                    mention("John", EntityType::Person),
                ],
                None,
            )
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], ids[2]);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_same_name_different_type_distinct() {
        let (_, resolver) = resolver();
        let ids = resolver
            .resolve_batch(
                "b1",
                &[
                    mention("Mercury", EntityType::Person),
                    mention("Mercury", EntityType::Product),
                ],
                None,
            )
            .unwrap();
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_lookup_query_entities_no_insert() {
        let (store, resolver) = resolver();
        resolver
            .resolve_batch("b1", &[mention("Melanie", EntityType::Person)], None)
            .unwrap();

        let found = resolver
            .lookup_query_entities("b1", "what did melanie do in June")
            .unwrap();
        assert_eq!(found.len(), 1);

        // Unknown tokens resolve to nothing and create nothing.
        let none = resolver.lookup_query_entities("b1", "quantum flux").unwrap();
        assert!(none.is_empty());
        let count: i64 = {
            let conn = store.lock();
            conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count, 1);
    }

    #[test]
    fn test_lookup_matches_bigrams() {
        let (_, resolver) = resolver();
        resolver
            .resolve_batch("b1", &[mention("New York", EntityType::Place)], None)
            .unwrap();
        let found = resolver
            .lookup_query_entities("b1", "who lives in New York these days")
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
