//! Link synthesis for newly retained units.
//!
//! Runs three batched phases over a retain batch: entity links (shared
//! referent, weight 1.0), temporal links (near in `event_date`), and
//! semantic links (near in embedding space). All edges go through the
//! composite-uniqueness upsert, so re-running is harmless.

use crate::config::RetainConfig;
use crate::models::{EntityId, MemoryLink, MemoryUnit};
use crate::storage::SqliteStore;
use crate::Result;
use chrono::Duration;
use std::sync::Arc;

/// Floor for temporal link weights.
const TEMPORAL_WEIGHT_FLOOR: f32 = 0.3;

/// Builds graph edges for freshly inserted units.
pub struct LinkSynthesizer {
    store: Arc<SqliteStore>,
    config: RetainConfig,
}

impl LinkSynthesizer {
    /// Creates a new synthesizer.
    #[must_use]
    pub const fn new(store: Arc<SqliteStore>, config: RetainConfig) -> Self {
        Self { store, config }
    }

    /// Synthesizes entity, temporal, and semantic links for the given
    /// units. `entities_per_unit` pairs with `units` by index. Returns the
    /// number of edges written.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage phase fails.
    pub fn synthesize(
        &self,
        bank_id: &str,
        units: &[MemoryUnit],
        entities_per_unit: &[Vec<EntityId>],
    ) -> Result<usize> {
        let mut links: Vec<MemoryLink> = Vec::new();

        self.entity_links(bank_id, units, entities_per_unit, &mut links)?;
        self.temporal_links(bank_id, units, &mut links)?;
        self.semantic_links(bank_id, units, &mut links)?;

        let count = links.len();
        self.store.upsert_links(bank_id, &links)?;
        tracing::debug!(bank_id, edges = count, "link synthesis complete");
        Ok(count)
    }

    /// Phase 1: bidirectional `entity` links between units sharing a
    /// referent.
    fn entity_links(
        &self,
        bank_id: &str,
        units: &[MemoryUnit],
        entities_per_unit: &[Vec<EntityId>],
        links: &mut Vec<MemoryLink>,
    ) -> Result<()> {
        let mut all_entities: Vec<EntityId> = entities_per_unit
            .iter()
            .flat_map(|ids| ids.iter().cloned())
            .collect();
        all_entities.sort();
        all_entities.dedup();
        if all_entities.is_empty() {
            return Ok(());
        }

        let mentions = self.store.units_mentioning_entities(bank_id, &all_entities)?;

        for (unit, entity_ids) in units.iter().zip(entities_per_unit) {
            for entity_id in entity_ids {
                for (other_unit, other_entity) in &mentions {
                    if other_entity != entity_id || *other_unit == unit.id {
                        continue;
                    }
                    links.push(MemoryLink::entity(
                        unit.id.clone(),
                        other_unit.clone(),
                        entity_id.clone(),
                    ));
                    links.push(MemoryLink::entity(
                        other_unit.clone(),
                        unit.id.clone(),
                        entity_id.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Phase 2: `temporal` links to units within the event-date window,
    /// weight `max(0.3, 1 - Δhours/window)`.
    fn temporal_links(
        &self,
        bank_id: &str,
        units: &[MemoryUnit],
        links: &mut Vec<MemoryLink>,
    ) -> Result<()> {
        let window = Duration::hours(self.config.temporal_window_hours);
        for unit in units {
            let neighbors = self.store.units_in_time_window(
                bank_id,
                unit.event_date - window,
                unit.event_date + window,
                // Fetch beyond k so the nearest survive the cap after
                // excluding the unit itself.
                self.config.temporal_link_k * 4 + 1,
            )?;

            let mut scored: Vec<(crate::models::UnitId, f32)> = neighbors
                .into_iter()
                .filter(|(id, _)| *id != unit.id)
                .map(|(id, event_date)| {
                    let delta_hours = (event_date - unit.event_date).num_minutes().abs() as f32
                        / 60.0;
                    let weight = (1.0
                        - delta_hours / self.config.temporal_window_hours as f32)
                        .max(TEMPORAL_WEIGHT_FLOOR);
                    (id, weight)
                })
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(self.config.temporal_link_k);

            for (other, weight) in scored {
                links.push(MemoryLink::temporal(unit.id.clone(), other.clone(), weight));
                links.push(MemoryLink::temporal(other, unit.id.clone(), weight));
            }
        }
        Ok(())
    }

    /// Phase 3: `semantic` links to embedding neighbors at or above the
    /// link threshold, weight = cosine.
    fn semantic_links(
        &self,
        bank_id: &str,
        units: &[MemoryUnit],
        links: &mut Vec<MemoryLink>,
    ) -> Result<()> {
        for unit in units {
            let neighbors = self.store.vector_top_k(
                bank_id,
                &unit.embedding,
                &[],
                self.config.semantic_link_k + 1,
                self.config.semantic_link_threshold,
            )?;
            for (other, similarity) in neighbors {
                if other == unit.id {
                    continue;
                }
                links.push(MemoryLink::semantic(
                    unit.id.clone(),
                    other.clone(),
                    similarity,
                ));
                links.push(MemoryLink::semantic(other, unit.id.clone(), similarity));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, EntityType, FactType, LinkType, UnitId};
    use crate::models::normalize_name;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn unit(text: &str, embedding: Vec<f32>, event_date: chrono::DateTime<Utc>) -> MemoryUnit {
        MemoryUnit {
            id: UnitId::generate(),
            bank_id: "b1".to_string(),
            text: text.to_string(),
            fact_type: FactType::World,
            context: None,
            created_at: Utc::now(),
            event_date,
            occurred_start: None,
            occurred_end: None,
            mentioned_at: None,
            document_id: None,
            consolidated_at: None,
            embedding,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            proof_count: None,
            source_memory_ids: Vec::new(),
            history: Vec::new(),
        }
    }

    fn setup() -> (Arc<SqliteStore>, LinkSynthesizer) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.ensure_bank("b1").unwrap();
        let synthesizer = LinkSynthesizer::new(Arc::clone(&store), RetainConfig::default());
        (store, synthesizer)
    }

    #[test]
    fn test_entity_links_bidirectional() {
        let (store, synthesizer) = setup();
        let entity = store
            .insert_entity(&Entity {
                id: crate::models::EntityId::generate(),
                bank_id: "b1".to_string(),
                canonical_name: "John".to_string(),
                normalized_name: normalize_name("John"),
                entity_type: EntityType::Person,
                embedding: vec![1.0, 0.0],
                aliases: Vec::new(),
                created_at: Utc::now(),
            })
            .unwrap();

        let old = unit("John lives in New York.", vec![1.0, 0.0], Utc::now());
        store.insert_units(std::slice::from_ref(&old)).unwrap();
        store
            .link_units_to_entities(&[(old.id.clone(), entity.id.clone())])
            .unwrap();

        let new = unit("John visited Boston.", vec![0.0, 1.0], Utc::now());
        store.insert_units(std::slice::from_ref(&new)).unwrap();
        store
            .link_units_to_entities(&[(new.id.clone(), entity.id.clone())])
            .unwrap();

        synthesizer
            .synthesize("b1", std::slice::from_ref(&new), &[vec![entity.id.clone()]])
            .unwrap();

        assert!(store
            .bidirectional_link_exists("b1", &new.id, &old.id, LinkType::Entity)
            .unwrap());
    }

    #[test]
    fn test_temporal_links_weighted_by_proximity() {
        let (store, synthesizer) = setup();
        let base = Utc::now();
        let near = unit("near event", vec![1.0, 0.0], base + Duration::hours(1));
        let far = unit("far event", vec![0.0, 1.0], base + Duration::hours(48));
        store.insert_units(&[near.clone(), far.clone()]).unwrap();

        let new = unit("new event", vec![0.5, 0.5], base);
        store.insert_units(std::slice::from_ref(&new)).unwrap();
        synthesizer
            .synthesize("b1", std::slice::from_ref(&new), &[Vec::new()])
            .unwrap();

        let links = store.links_from_units("b1", &[new.id.clone()]).unwrap();
        let temporal: Vec<&MemoryLink> = links
            .iter()
            .filter(|l| l.link_type == LinkType::Temporal)
            .collect();
        assert_eq!(temporal.len(), 2);
        let near_weight = temporal.iter().find(|l| l.to_unit == near.id).unwrap().weight;
        let far_weight = temporal.iter().find(|l| l.to_unit == far.id).unwrap().weight;
        assert!(near_weight > far_weight);
        assert!(far_weight >= 0.3);
    }

    #[test]
    fn test_semantic_links_threshold() {
        let (store, synthesizer) = setup();
        let similar = unit("similar", vec![1.0, 0.0], Utc::now());
        let orthogonal = unit("orthogonal", vec![0.0, 1.0], Utc::now());
        store
            .insert_units(&[similar.clone(), orthogonal.clone()])
            .unwrap();

        let new = unit("new", vec![1.0, 0.0], Utc::now() + Duration::days(30));
        store.insert_units(std::slice::from_ref(&new)).unwrap();
        synthesizer
            .synthesize("b1", std::slice::from_ref(&new), &[Vec::new()])
            .unwrap();

        let links = store.links_from_units("b1", &[new.id.clone()]).unwrap();
        let semantic: Vec<&MemoryLink> = links
            .iter()
            .filter(|l| l.link_type == LinkType::Semantic)
            .collect();
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].to_unit, similar.id);
        assert!((semantic[0].weight - 1.0).abs() < 1e-5);
    }
}
