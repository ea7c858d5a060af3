//! Reflection persistence and retrieval.

use super::vector::{cosine_similarity, TopK};
use super::{blob_to_vec, parse_json_field, parse_timestamp, vec_to_blob, SqliteStore};
use crate::models::{Reflection, TagMatch};
use crate::Result;
use rusqlite::{params, OptionalExtension, Row};

const REFLECTION_COLUMNS: &str =
    "id, bank_id, name, source_query, content, embedding, reflect_response, tags, \
     created_at, updated_at";

fn row_to_reflection(row: &Row<'_>) -> rusqlite::Result<(Reflection, String, String)> {
    let embedding: Vec<u8> = row.get(5)?;
    let reflect_response: Option<String> = row.get(6)?;
    let tags: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok((
        Reflection {
            id: row.get(0)?,
            bank_id: row.get(1)?,
            name: row.get(2)?,
            source_query: row.get(3)?,
            content: row.get(4)?,
            embedding: blob_to_vec(&embedding),
            reflect_response: reflect_response.and_then(|s| serde_json::from_str(&s).ok()),
            tags: parse_json_field(tags),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        },
        created_at,
        updated_at,
    ))
}

fn finish(raw: (Reflection, String, String)) -> Result<Reflection> {
    let (mut reflection, created_at, updated_at) = raw;
    reflection.created_at = parse_timestamp(&created_at)?;
    reflection.updated_at = parse_timestamp(&updated_at)?;
    Ok(reflection)
}

impl SqliteStore {
    /// Inserts or updates a reflection.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn upsert_reflection(&self, reflection: &Reflection) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO reflections
                 (id, bank_id, name, source_query, content, embedding, reflect_response,
                  tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 source_query = excluded.source_query,
                 content = excluded.content,
                 embedding = excluded.embedding,
                 reflect_response = excluded.reflect_response,
                 tags = excluded.tags,
                 updated_at = excluded.updated_at",
            params![
                reflection.id,
                reflection.bank_id,
                reflection.name,
                reflection.source_query,
                reflection.content,
                vec_to_blob(&reflection.embedding),
                reflection
                    .reflect_response
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                serde_json::to_string(&reflection.tags)
                    .map_err(|e| crate::Error::op("serialize_reflection_tags", e))?,
                reflection.created_at.to_rfc3339(),
                reflection.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetches a reflection by id within a bank.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_reflection(&self, bank_id: &str, id: &str) -> Result<Option<Reflection>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {REFLECTION_COLUMNS} FROM reflections
                     WHERE bank_id = ?1 AND id = ?2"
                ),
                params![bank_id, id],
                row_to_reflection,
            )
            .optional()?;
        raw.map(finish).transpose()
    }

    /// Lists a bank's reflections, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_reflections(&self, bank_id: &str) -> Result<Vec<Reflection>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REFLECTION_COLUMNS} FROM reflections
             WHERE bank_id = ?1 ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map(params![bank_id], row_to_reflection)?;
        let mut reflections = Vec::new();
        for row in rows {
            reflections.push(finish(row?)?);
        }
        Ok(reflections)
    }

    /// Deletes a reflection. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete_reflection(&self, bank_id: &str, id: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM reflections WHERE bank_id = ?1 AND id = ?2",
            params![bank_id, id],
        )?;
        Ok(deleted > 0)
    }

    /// ANN top-k over a bank's reflections, tag-filtered.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn reflections_top_k(
        &self,
        bank_id: &str,
        embedding: &[f32],
        tags: &[String],
        tags_match: TagMatch,
        k: usize,
    ) -> Result<Vec<(Reflection, f32)>> {
        let reflections = self.list_reflections(bank_id)?;
        let mut topk = TopK::new(k);
        for reflection in reflections {
            if !tags_match.matches(tags, &reflection.tags) {
                continue;
            }
            let similarity = cosine_similarity(embedding, &reflection.embedding);
            topk.push(reflection, similarity);
        }
        Ok(topk.into_sorted())
    }
}
