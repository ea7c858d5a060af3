//! Entity persistence and resolution queries.

use super::vector::{cosine_similarity, TopK};
use super::{blob_to_vec, parse_json_field, parse_timestamp, sql_placeholders, vec_to_blob, SqliteStore};
use crate::models::{Entity, EntityId, EntityType, UnitId};
use crate::Result;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

const ENTITY_COLUMNS: &str =
    "id, bank_id, canonical_name, normalized_name, entity_type, embedding, aliases, created_at";

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<(Entity, String)> {
    let entity_type: String = row.get(4)?;
    let embedding: Vec<u8> = row.get(5)?;
    let aliases: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok((
        Entity {
            id: EntityId::new(row.get::<_, String>(0)?),
            bank_id: row.get(1)?,
            canonical_name: row.get(2)?,
            normalized_name: row.get(3)?,
            entity_type: EntityType::parse(&entity_type),
            embedding: blob_to_vec(&embedding),
            aliases: parse_json_field(aliases),
            created_at: chrono::Utc::now(),
        },
        created_at,
    ))
}

impl SqliteStore {
    /// Inserts an entity, honoring the per-bank `(normalized, type)`
    /// uniqueness invariant. On collision the existing row wins and is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn insert_entity(&self, entity: &Entity) -> Result<Entity> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO entities
                     (id, bank_id, canonical_name, normalized_name, entity_type,
                      embedding, aliases, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(bank_id, normalized_name, entity_type) DO NOTHING",
                params![
                    entity.id.as_str(),
                    entity.bank_id,
                    entity.canonical_name,
                    entity.normalized_name,
                    entity.entity_type.as_str(),
                    vec_to_blob(&entity.embedding),
                    serde_json::to_string(&entity.aliases)
                        .map_err(|e| crate::Error::op("serialize_aliases", e))?,
                    entity.created_at.to_rfc3339(),
                ],
            )?;
        }
        // Either our row or the colliding one.
        self.find_entity_normalized(&entity.bank_id, &entity.normalized_name, entity.entity_type)?
            .ok_or_else(|| crate::Error::op("insert_entity", "row vanished after insert"))
    }

    /// Exact lookup by normalized name and type.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_entity_normalized(
        &self,
        bank_id: &str,
        normalized_name: &str,
        entity_type: EntityType,
    ) -> Result<Option<Entity>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE bank_id = ?1 AND normalized_name = ?2 AND entity_type = ?3"
                ),
                params![bank_id, normalized_name, entity_type.as_str()],
                row_to_entity,
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((mut entity, created_at)) => {
                entity.created_at = parse_timestamp(&created_at)?;
                Ok(Some(entity))
            },
        }
    }

    /// Lists a bank's entities, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_entities(&self, bank_id: &str) -> Result<Vec<Entity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE bank_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![bank_id], row_to_entity)?;
        let mut entities = Vec::new();
        for row in rows {
            let (mut entity, created_at) = row?;
            entity.created_at = parse_timestamp(&created_at)?;
            entities.push(entity);
        }
        Ok(entities)
    }

    /// Exact lookup by normalized name across every entity type.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_entities_by_normalized(
        &self,
        bank_id: &str,
        normalized_name: &str,
    ) -> Result<Vec<Entity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
             WHERE bank_id = ?1 AND normalized_name = ?2"
        ))?;
        let rows = stmt.query_map(params![bank_id, normalized_name], row_to_entity)?;
        let mut entities = Vec::new();
        for row in rows {
            let (mut entity, created_at) = row?;
            entity.created_at = parse_timestamp(&created_at)?;
            entities.push(entity);
        }
        Ok(entities)
    }

    /// ANN neighbors of an embedding among a bank's entities of one type.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn entities_top_k(
        &self,
        bank_id: &str,
        embedding: &[f32],
        entity_type: EntityType,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(Entity, f32)>> {
        let candidates: Vec<(EntityId, f32)> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT id, embedding FROM entities
                 WHERE bank_id = ?1 AND entity_type = ?2",
            )?;
            let mut topk = TopK::new(k);
            let mut rows = stmt.query(params![bank_id, entity_type.as_str()])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let similarity = cosine_similarity(embedding, &blob_to_vec(&blob));
                if similarity >= min_similarity {
                    topk.push(EntityId::new(id), similarity);
                }
            }
            topk.into_sorted()
        };

        let mut results = Vec::with_capacity(candidates.len());
        for (id, similarity) in candidates {
            if let Some(entity) = self.get_entity(bank_id, &id)? {
                results.push((entity, similarity));
            }
        }
        Ok(results)
    }

    /// Fetches one entity by id within a bank.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_entity(&self, bank_id: &str, id: &EntityId) -> Result<Option<Entity>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities WHERE bank_id = ?1 AND id = ?2"
                ),
                params![bank_id, id.as_str()],
                row_to_entity,
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((mut entity, created_at)) => {
                entity.created_at = parse_timestamp(&created_at)?;
                Ok(Some(entity))
            },
        }
    }

    /// Bulk-links units to their mentioned entities. Collisions are
    /// success.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch fails.
    pub fn link_units_to_entities(&self, pairs: &[(UnitId, EntityId)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO unit_entities (unit_id, entity_id) VALUES (?1, ?2)
                 ON CONFLICT(unit_id, entity_id) DO NOTHING",
            )?;
            for (unit_id, entity_id) in pairs {
                stmt.execute(params![unit_id.as_str(), entity_id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Ids of every unit mentioning any of the given entities, with the
    /// shared entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn units_mentioning_entities(
        &self,
        bank_id: &str,
        entity_ids: &[EntityId],
    ) -> Result<Vec<(UnitId, EntityId)>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let mut results = Vec::new();
        for chunk in entity_ids.chunks(256) {
            let sql = format!(
                "SELECT ue.unit_id, ue.entity_id
                 FROM unit_entities ue
                 JOIN memory_units m ON m.id = ue.unit_id
                 WHERE m.bank_id = ?1 AND ue.entity_id IN ({})",
                sql_placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<&str> = vec![bank_id];
            bind.extend(chunk.iter().map(EntityId::as_str));
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                let unit: String = row.get(0)?;
                let entity: String = row.get(1)?;
                Ok((UnitId::new(unit), EntityId::new(entity)))
            })?;
            for row in rows {
                results.push(row?);
            }
        }
        Ok(results)
    }

    /// Entities mentioned by each of the given units.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn entities_for_units(
        &self,
        bank_id: &str,
        unit_ids: &[UnitId],
    ) -> Result<Vec<(UnitId, Entity)>> {
        if unit_ids.is_empty() {
            return Ok(Vec::new());
        }
        let pairs: Vec<(UnitId, EntityId)> = {
            let conn = self.lock();
            let mut pairs = Vec::new();
            for chunk in unit_ids.chunks(256) {
                let sql = format!(
                    "SELECT ue.unit_id, ue.entity_id
                     FROM unit_entities ue
                     JOIN memory_units m ON m.id = ue.unit_id
                     WHERE m.bank_id = ?1 AND ue.unit_id IN ({})",
                    sql_placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut bind: Vec<&str> = vec![bank_id];
                bind.extend(chunk.iter().map(UnitId::as_str));
                let rows = stmt.query_map(params_from_iter(bind), |row| {
                    let unit: String = row.get(0)?;
                    let entity: String = row.get(1)?;
                    Ok((UnitId::new(unit), EntityId::new(entity)))
                })?;
                for row in rows {
                    pairs.push(row?);
                }
            }
            pairs
        };

        let mut results = Vec::with_capacity(pairs.len());
        for (unit_id, entity_id) in pairs {
            if let Some(entity) = self.get_entity(bank_id, &entity_id)? {
                results.push((unit_id, entity));
            }
        }
        Ok(results)
    }
}
