//! Memory link persistence and graph-neighbor queries.

use super::{sql_placeholders, SqliteStore};
use crate::models::{EntityId, LinkType, MemoryLink, UnitId};
use crate::Result;
use chrono::Utc;
use rusqlite::{params, params_from_iter};

impl SqliteStore {
    /// Bulk-upserts links inside one transaction.
    ///
    /// Collisions on the composite key `(from, to, type, entity-sentinel)`
    /// are treated as success: the existing edge keeps the larger weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch fails; it rolls back as a unit.
    pub fn upsert_links(&self, bank_id: &str, links: &[MemoryLink]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO memory_links
                     (bank_id, from_unit, to_unit, link_type, entity_id, weight, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(from_unit, to_unit, link_type, entity_id)
                 DO UPDATE SET weight = MAX(weight, excluded.weight)",
            )?;
            let now = Utc::now().to_rfc3339();
            for link in links {
                stmt.execute(params![
                    bank_id,
                    link.from_unit.as_str(),
                    link.to_unit.as_str(),
                    link.link_type.as_str(),
                    link.entity_sentinel(),
                    f64::from(link.weight),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        metrics::counter!("store_links_upserted_total").increment(links.len() as u64);
        Ok(())
    }

    /// Outgoing links from any of the given units, for graph expansion.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn links_from_units(
        &self,
        bank_id: &str,
        from_units: &[UnitId],
    ) -> Result<Vec<MemoryLink>> {
        if from_units.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let mut links = Vec::new();
        for chunk in from_units.chunks(256) {
            let sql = format!(
                "SELECT from_unit, to_unit, link_type, entity_id, weight
                 FROM memory_links
                 WHERE bank_id = ?1 AND from_unit IN ({})",
                sql_placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<&str> = vec![bank_id];
            bind.extend(chunk.iter().map(UnitId::as_str));
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                let from: String = row.get(0)?;
                let to: String = row.get(1)?;
                let link_type: String = row.get(2)?;
                let entity_id: String = row.get(3)?;
                let weight: f64 = row.get(4)?;
                Ok((from, to, link_type, entity_id, weight))
            })?;
            for row in rows {
                let (from, to, link_type, entity_id, weight) = row?;
                let Some(link_type) = LinkType::parse(&link_type) else {
                    continue;
                };
                links.push(MemoryLink {
                    from_unit: UnitId::new(from),
                    to_unit: UnitId::new(to),
                    link_type,
                    entity_id: if entity_id.is_empty() {
                        None
                    } else {
                        Some(EntityId::new(entity_id))
                    },
                    weight: weight as f32,
                });
            }
        }
        Ok(links)
    }

    /// Whether a link of the given type exists in both directions between
    /// two units.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn bidirectional_link_exists(
        &self,
        bank_id: &str,
        a: &UnitId,
        b: &UnitId,
        link_type: LinkType,
    ) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_links
             WHERE bank_id = ?1 AND link_type = ?2
               AND ((from_unit = ?3 AND to_unit = ?4)
                 OR (from_unit = ?4 AND to_unit = ?3))",
            params![bank_id, link_type.as_str(), a.as_str(), b.as_str()],
            |row| row.get(0),
        )?;
        Ok(count >= 2)
    }

    /// Number of links in a bank, for tests and stats.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_links(&self, bank_id: &str) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_links WHERE bank_id = ?1",
            params![bank_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FactType, MemoryUnit};
    use std::collections::BTreeMap;

    fn setup() -> (SqliteStore, UnitId, UnitId) {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_bank("b1").unwrap();
        let make = |text: &str| MemoryUnit {
            id: UnitId::generate(),
            bank_id: "b1".to_string(),
            text: text.to_string(),
            fact_type: FactType::World,
            context: None,
            created_at: Utc::now(),
            event_date: Utc::now(),
            occurred_start: None,
            occurred_end: None,
            mentioned_at: None,
            document_id: None,
            consolidated_at: None,
            embedding: vec![1.0, 0.0],
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            proof_count: None,
            source_memory_ids: Vec::new(),
            history: Vec::new(),
        };
        let a = make("fact a");
        let b = make("fact b");
        store.insert_units(&[a.clone(), b.clone()]).unwrap();
        (store, a.id, b.id)
    }

    #[test]
    fn test_upsert_links_conflict_is_success() {
        let (store, a, b) = setup();
        let link = MemoryLink::semantic(a.clone(), b.clone(), 0.7);
        store.upsert_links("b1", std::slice::from_ref(&link)).unwrap();
        // Second upsert with a higher weight keeps the higher weight.
        let stronger = MemoryLink::semantic(a.clone(), b.clone(), 0.9);
        store.upsert_links("b1", &[stronger]).unwrap();

        let links = store.links_from_units("b1", &[a]).unwrap();
        assert_eq!(links.len(), 1);
        assert!((links[0].weight - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_entity_sentinel_uniqueness() {
        let (store, a, b) = setup();
        let semantic = MemoryLink::semantic(a.clone(), b.clone(), 0.5);
        let entity = MemoryLink::entity(a.clone(), b.clone(), EntityId::new("e1"));
        let other_entity = MemoryLink::entity(a.clone(), b.clone(), EntityId::new("e2"));
        store
            .upsert_links("b1", &[semantic, entity, other_entity])
            .unwrap();
        assert_eq!(store.count_links("b1").unwrap(), 3);
    }

    #[test]
    fn test_bidirectional_link_exists() {
        let (store, a, b) = setup();
        store
            .upsert_links("b1", &[MemoryLink::semantic(a.clone(), b.clone(), 0.8)])
            .unwrap();
        assert!(!store
            .bidirectional_link_exists("b1", &a, &b, LinkType::Semantic)
            .unwrap());
        store
            .upsert_links("b1", &[MemoryLink::semantic(b.clone(), a.clone(), 0.8)])
            .unwrap();
        assert!(store
            .bidirectional_link_exists("b1", &a, &b, LinkType::Semantic)
            .unwrap());
    }
}
