//! Memory unit persistence and retrieval queries.

use super::vector::{cosine_similarity, TopK};
use super::{
    blob_to_vec, parse_json_field, parse_timestamp, sql_placeholders, vec_to_blob, SqliteStore,
};
use crate::models::{FactType, MemoryUnit, UnitId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

const UNIT_COLUMNS: &str = "id, bank_id, text, fact_type, context, created_at, event_date, \
     occurred_start, occurred_end, mentioned_at, document_id, consolidated_at, embedding, \
     tags, metadata, proof_count, source_memory_ids, history";

fn row_to_unit(row: &Row<'_>) -> rusqlite::Result<MemoryUnit> {
    let fact_type: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let event_date: String = row.get(6)?;
    let occurred_start: Option<String> = row.get(7)?;
    let occurred_end: Option<String> = row.get(8)?;
    let mentioned_at: Option<String> = row.get(9)?;
    let consolidated_at: Option<String> = row.get(11)?;
    let embedding: Vec<u8> = row.get(12)?;
    let tags: Option<String> = row.get(13)?;
    let metadata: Option<String> = row.get(14)?;
    let proof_count: Option<i64> = row.get(15)?;
    let source_memory_ids: Option<String> = row.get(16)?;
    let history: Option<String> = row.get(17)?;

    let parse = |raw: String| {
        parse_timestamp(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(e.to_string())),
            )
        })
    };

    Ok(MemoryUnit {
        id: UnitId::new(row.get::<_, String>(0)?),
        bank_id: row.get(1)?,
        text: row.get(2)?,
        fact_type: FactType::parse(&fact_type).unwrap_or(FactType::Observation),
        context: row.get(4)?,
        created_at: parse(created_at)?,
        event_date: parse(event_date)?,
        occurred_start: occurred_start.map(parse).transpose()?,
        occurred_end: occurred_end.map(parse).transpose()?,
        mentioned_at: mentioned_at.map(parse).transpose()?,
        document_id: row.get(10)?,
        consolidated_at: consolidated_at.map(parse).transpose()?,
        embedding: blob_to_vec(&embedding),
        tags: parse_json_field(tags),
        metadata: parse_json_field(metadata),
        proof_count: proof_count.and_then(|p| u32::try_from(p).ok()),
        source_memory_ids: parse_json_field::<Vec<String>>(source_memory_ids)
            .into_iter()
            .map(UnitId::new)
            .collect(),
        history: parse_json_field(history),
    })
}

fn fact_type_predicate(fact_types: &[FactType]) -> String {
    if fact_types.is_empty() {
        String::new()
    } else {
        let labels: Vec<String> = fact_types
            .iter()
            .map(|ft| format!("'{}'", ft.as_str()))
            .collect();
        format!(" AND fact_type IN ({})", labels.join(","))
    }
}

/// Sanitizes free text into an FTS5 OR-query over its alphanumeric tokens.
fn fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

impl SqliteStore {
    /// Bulk-inserts memory units inside one transaction.
    ///
    /// Relative order within the batch is preserved in `created_at`
    /// tie-breaks by the id's insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; the batch rolls back.
    pub fn insert_units(&self, units: &[MemoryUnit]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO memory_units
                     (id, bank_id, text, fact_type, context, created_at, event_date,
                      occurred_start, occurred_end, mentioned_at, document_id,
                      consolidated_at, embedding, tags, metadata, proof_count,
                      source_memory_ids, history)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18)",
            )?;
            for unit in units {
                let source_ids = if unit.source_memory_ids.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&unit.source_memory_ids).map_err(|e| {
                        Error::op("serialize_source_memory_ids", e)
                    })?)
                };
                let history = if unit.history.is_empty() {
                    None
                } else {
                    Some(
                        serde_json::to_string(&unit.history)
                            .map_err(|e| Error::op("serialize_history", e))?,
                    )
                };
                stmt.execute(params![
                    unit.id.as_str(),
                    unit.bank_id,
                    unit.text,
                    unit.fact_type.as_str(),
                    unit.context,
                    unit.created_at.to_rfc3339(),
                    unit.event_date.to_rfc3339(),
                    unit.occurred_start.map(|t| t.to_rfc3339()),
                    unit.occurred_end.map(|t| t.to_rfc3339()),
                    unit.mentioned_at.map(|t| t.to_rfc3339()),
                    unit.document_id,
                    unit.consolidated_at.map(|t| t.to_rfc3339()),
                    vec_to_blob(&unit.embedding),
                    serde_json::to_string(&unit.tags)
                        .map_err(|e| Error::op("serialize_tags", e))?,
                    serde_json::to_string(&unit.metadata)
                        .map_err(|e| Error::op("serialize_metadata", e))?,
                    unit.proof_count.map(i64::from),
                    source_ids,
                    history,
                ])?;
            }
        }
        tx.commit()?;
        metrics::counter!("store_units_inserted_total").increment(units.len() as u64);
        Ok(())
    }

    /// Fetches one unit by id within a bank.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_unit(&self, bank_id: &str, id: &UnitId) -> Result<Option<MemoryUnit>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {UNIT_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND id = ?2"
                ),
                params![bank_id, id.as_str()],
                row_to_unit,
            )
            .optional()?)
    }

    /// Fetches units by id, preserving the requested order. Missing ids are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_units_by_ids(&self, bank_id: &str, ids: &[UnitId]) -> Result<Vec<MemoryUnit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let mut found: std::collections::HashMap<UnitId, MemoryUnit> = std::collections::HashMap::new();
        for chunk in ids.chunks(256) {
            let sql = format!(
                "SELECT {UNIT_COLUMNS} FROM memory_units
                 WHERE bank_id = ?1 AND id IN ({})",
                sql_placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<&str> = vec![bank_id];
            bind.extend(chunk.iter().map(UnitId::as_str));
            let rows = stmt.query_map(params_from_iter(bind), row_to_unit)?;
            for row in rows {
                let unit = row?;
                found.insert(unit.id.clone(), unit);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Vector top-k over a bank: exact cosine against every candidate row
    /// matching the fact-type filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn vector_top_k(
        &self,
        bank_id: &str,
        embedding: &[f32],
        fact_types: &[FactType],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(UnitId, f32)>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT id, embedding FROM memory_units WHERE bank_id = ?1{}",
            fact_type_predicate(fact_types)
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut topk = TopK::new(k);
        let mut rows = stmt.query(params![bank_id])?;
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let similarity = cosine_similarity(embedding, &blob_to_vec(&blob));
            if similarity >= min_similarity {
                topk.push(UnitId::new(id), similarity);
            }
        }
        Ok(topk.into_sorted())
    }

    /// Lexical top-k over a bank via FTS5 `bm25()`.
    ///
    /// Scores are negated bm25 rank so that higher is better.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn lexical_top_k(
        &self,
        bank_id: &str,
        query: &str,
        fact_types: &[FactType],
        k: usize,
    ) -> Result<Vec<(UnitId, f32)>> {
        let Some(match_query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let conn = self.lock();
        let sql = format!(
            "SELECT m.id, bm25(memory_units_fts) AS rank
             FROM memory_units_fts
             JOIN memory_units m ON m.rowid = memory_units_fts.rowid
             WHERE memory_units_fts MATCH ?1 AND m.bank_id = ?2{}
             ORDER BY rank
             LIMIT ?3",
            fact_type_predicate(fact_types).replace("fact_type", "m.fact_type")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![match_query, bank_id, i64::try_from(k).unwrap_or(i64::MAX)],
            |row| {
                let id: String = row.get(0)?;
                let rank: f64 = row.get(1)?;
                Ok((UnitId::new(id), -rank as f32))
            },
        )?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Newest units in a bank, for the recency seed signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent_units(
        &self,
        bank_id: &str,
        fact_types: &[FactType],
        k: usize,
    ) -> Result<Vec<(UnitId, DateTime<Utc>)>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT id, created_at FROM memory_units WHERE bank_id = ?1{}
             ORDER BY created_at DESC, id ASC LIMIT ?2",
            fact_type_predicate(fact_types)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![bank_id, i64::try_from(k).unwrap_or(i64::MAX)],
            |row| {
                let id: String = row.get(0)?;
                let created: String = row.get(1)?;
                Ok((id, created))
            },
        )?;
        let mut results = Vec::new();
        for row in rows {
            let (id, created) = row?;
            results.push((UnitId::new(id), parse_timestamp(&created)?));
        }
        Ok(results)
    }

    /// Units within a time window around `event_date`, nearest first, for
    /// temporal link synthesis.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn units_in_time_window(
        &self,
        bank_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(UnitId, DateTime<Utc>)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, event_date FROM memory_units
             WHERE bank_id = ?1 AND event_date >= ?2 AND event_date <= ?3
             ORDER BY event_date ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                bank_id,
                start.to_rfc3339(),
                end.to_rfc3339(),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            |row| {
                let id: String = row.get(0)?;
                let event: String = row.get(1)?;
                Ok((id, event))
            },
        )?;
        let mut results = Vec::new();
        for row in rows {
            let (id, event) = row?;
            results.push((UnitId::new(id), parse_timestamp(&event)?));
        }
        Ok(results)
    }

    /// Units awaiting consolidation, oldest first.
    ///
    /// Served by the partial index on
    /// `(bank_id, created_at) WHERE consolidated_at IS NULL AND fact_type
    /// IN ('experience', 'world')`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn unconsolidated_units(&self, bank_id: &str, limit: usize) -> Result<Vec<MemoryUnit>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM memory_units
             WHERE bank_id = ?1 AND consolidated_at IS NULL
               AND fact_type IN ('experience', 'world')
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        ))?;
        let rows = stmt.query_map(
            params![bank_id, i64::try_from(limit).unwrap_or(i64::MAX)],
            row_to_unit,
        )?;
        let mut units = Vec::new();
        for row in rows {
            units.push(row?);
        }
        Ok(units)
    }

    /// Stamps a unit's consolidation watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn mark_consolidated(
        &self,
        bank_id: &str,
        id: &UnitId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE memory_units SET consolidated_at = ?3
             WHERE bank_id = ?1 AND id = ?2 AND consolidated_at IS NULL",
            params![bank_id, id.as_str(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// All mental-model units in a bank.
    ///
    /// Served by the partial index on `(bank_id, fact_type) WHERE
    /// fact_type = 'mental_model'`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn mental_models(&self, bank_id: &str) -> Result<Vec<MemoryUnit>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM memory_units
             WHERE bank_id = ?1 AND fact_type = 'mental_model'
             ORDER BY created_at ASC, id ASC",
        ))?;
        let rows = stmt.query_map(params![bank_id], row_to_unit)?;
        let mut units = Vec::new();
        for row in rows {
            units.push(row?);
        }
        Ok(units)
    }

    /// Rewrites a mental model after an UPDATE action: text, embedding,
    /// proof count, sources, and history.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn update_mental_model(&self, unit: &MemoryUnit) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE memory_units SET
                 text = ?3, embedding = ?4, proof_count = ?5,
                 source_memory_ids = ?6, history = ?7
             WHERE bank_id = ?1 AND id = ?2",
            params![
                unit.bank_id,
                unit.id.as_str(),
                unit.text,
                vec_to_blob(&unit.embedding),
                unit.proof_count.map(i64::from),
                serde_json::to_string(&unit.source_memory_ids)
                    .map_err(|e| Error::op("serialize_source_memory_ids", e))?,
                serde_json::to_string(&unit.history)
                    .map_err(|e| Error::op("serialize_history", e))?,
            ],
        )?;
        Ok(())
    }

    /// Deletes every unit belonging to a document, returning the removed
    /// ids. Links and entity mentions cascade.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete_units_for_document(
        &self,
        bank_id: &str,
        document_id: &str,
    ) -> Result<Vec<UnitId>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let ids: Vec<UnitId> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM memory_units WHERE bank_id = ?1 AND document_id = ?2",
            )?;
            let rows = stmt.query_map(params![bank_id, document_id], |row| {
                row.get::<_, String>(0)
            })?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(UnitId::new(row?));
            }
            ids
        };
        tx.execute(
            "DELETE FROM memory_units WHERE bank_id = ?1 AND document_id = ?2",
            params![bank_id, document_id],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    /// Number of units in a bank.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_units(&self, bank_id: &str) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_units WHERE bank_id = ?1",
            params![bank_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FactType;
    use std::collections::BTreeMap;

    fn unit(bank: &str, text: &str, fact_type: FactType, embedding: Vec<f32>) -> MemoryUnit {
        MemoryUnit {
            id: UnitId::generate(),
            bank_id: bank.to_string(),
            text: text.to_string(),
            fact_type,
            context: None,
            created_at: Utc::now(),
            event_date: Utc::now(),
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

    fn store_with_bank() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_bank("b1").unwrap();
        store
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let store = store_with_bank();
        let u = unit("b1", "I ran a marathon.", FactType::Experience, vec![1.0, 0.0]);
        store.insert_units(std::slice::from_ref(&u)).unwrap();

        let fetched = store.get_unit("b1", &u.id).unwrap().unwrap();
        assert_eq!(fetched.text, "I ran a marathon.");
        assert_eq!(fetched.fact_type, FactType::Experience);
        assert_eq!(fetched.embedding, vec![1.0, 0.0]);
        assert!(fetched.consolidated_at.is_none());
    }

    #[test]
    fn test_bank_isolation() {
        let store = store_with_bank();
        store.ensure_bank("b2").unwrap();
        let u = unit("b1", "private fact", FactType::World, vec![1.0, 0.0]);
        store.insert_units(std::slice::from_ref(&u)).unwrap();

        assert!(store.get_unit("b2", &u.id).unwrap().is_none());
        assert!(store
            .vector_top_k("b2", &[1.0, 0.0], &[], 10, 0.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_vector_top_k_orders_by_similarity() {
        let store = store_with_bank();
        let close = unit("b1", "close", FactType::World, vec![1.0, 0.0]);
        let far = unit("b1", "far", FactType::World, vec![0.0, 1.0]);
        store.insert_units(&[close.clone(), far]).unwrap();

        let hits = store.vector_top_k("b1", &[1.0, 0.0], &[], 10, 0.0).unwrap();
        assert_eq!(hits[0].0, close.id);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_vector_top_k_fact_type_filter() {
        let store = store_with_bank();
        let w = unit("b1", "world", FactType::World, vec![1.0, 0.0]);
        let o = unit("b1", "opinion", FactType::Opinion, vec![1.0, 0.0]);
        store.insert_units(&[w, o]).unwrap();

        let hits = store
            .vector_top_k("b1", &[1.0, 0.0], &[FactType::Opinion], 10, 0.0)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_lexical_top_k_finds_text() {
        let store = store_with_bank();
        let u = unit(
            "b1",
            "Melanie painted watercolors in June",
            FactType::World,
            vec![1.0, 0.0],
        );
        let other = unit("b1", "unrelated entry", FactType::World, vec![0.0, 1.0]);
        store.insert_units(&[u.clone(), other]).unwrap();

        let hits = store
            .lexical_top_k("b1", "melanie watercolors", &[], 10)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, u.id);
    }

    #[test]
    fn test_unconsolidated_scan_and_watermark() {
        let store = store_with_bank();
        let u = unit("b1", "fact", FactType::World, vec![1.0, 0.0]);
        let op = unit("b1", "an opinion", FactType::Opinion, vec![1.0, 0.0]);
        store.insert_units(&[u.clone(), op]).unwrap();

        let pending = store.unconsolidated_units("b1", 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, u.id);

        store.mark_consolidated("b1", &u.id, Utc::now()).unwrap();
        assert!(store.unconsolidated_units("b1", 100).unwrap().is_empty());

        // Watermark is monotonic: a second stamp does not rewrite it.
        let first = store.get_unit("b1", &u.id).unwrap().unwrap().consolidated_at;
        store
            .mark_consolidated("b1", &u.id, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        let second = store.get_unit("b1", &u.id).unwrap().unwrap().consolidated_at;
        assert_eq!(first, second);
    }

    #[test]
    fn test_delete_units_for_document() {
        let store = store_with_bank();
        let mut u = unit("b1", "doc fact", FactType::World, vec![1.0, 0.0]);
        u.document_id = Some("doc-1".to_string());
        store.insert_units(std::slice::from_ref(&u)).unwrap();

        let removed = store.delete_units_for_document("b1", "doc-1").unwrap();
        assert_eq!(removed, vec![u.id.clone()]);
        assert!(store.get_unit("b1", &u.id).unwrap().is_none());
        // FTS row went with it.
        assert!(store.lexical_top_k("b1", "doc fact", &[], 10).unwrap().is_empty());
    }
}
