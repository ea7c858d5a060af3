//! Document persistence.

use super::{parse_json_field, parse_timestamp, SqliteStore};
use crate::models::Document;
use crate::Result;
use rusqlite::{params, OptionalExtension};

impl SqliteStore {
    /// Inserts or replaces a document row.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn upsert_document(&self, document: &Document) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO documents (id, bank_id, original_text, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(bank_id, id) DO UPDATE SET
                 original_text = excluded.original_text,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at",
            params![
                document.id,
                document.bank_id,
                document.original_text,
                serde_json::to_string(&document.metadata)
                    .map_err(|e| crate::Error::op("serialize_document_metadata", e))?,
                document.created_at.to_rfc3339(),
                document.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetches a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_document(&self, bank_id: &str, id: &str) -> Result<Option<Document>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT id, bank_id, original_text, metadata, created_at, updated_at
                 FROM documents WHERE bank_id = ?1 AND id = ?2",
                params![bank_id, id],
                |row| {
                    let metadata: Option<String> = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    let updated_at: String = row.get(5)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        metadata,
                        created_at,
                        updated_at,
                    ))
                },
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((id, bank_id, original_text, metadata, created_at, updated_at)) => {
                Ok(Some(Document {
                    id,
                    bank_id,
                    original_text,
                    metadata: parse_json_field(metadata),
                    created_at: parse_timestamp(&created_at)?,
                    updated_at: parse_timestamp(&updated_at)?,
                }))
            },
        }
    }

    /// Deletes a document row; its units are removed separately by
    /// [`SqliteStore::delete_units_for_document`]. Returns whether a row
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete_document(&self, bank_id: &str, id: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM documents WHERE bank_id = ?1 AND id = ?2",
            params![bank_id, id],
        )?;
        Ok(deleted > 0)
    }

    /// Lists documents in a bank, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_documents(&self, bank_id: &str) -> Result<Vec<Document>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, bank_id, original_text, metadata, created_at, updated_at
             FROM documents WHERE bank_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![bank_id], |row| {
            let metadata: Option<String> = row.get(3)?;
            let created_at: String = row.get(4)?;
            let updated_at: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                metadata,
                created_at,
                updated_at,
            ))
        })?;
        let mut documents = Vec::new();
        for row in rows {
            let (id, bank_id, original_text, metadata, created_at, updated_at) = row?;
            documents.push(Document {
                id,
                bank_id,
                original_text,
                metadata: parse_json_field(metadata),
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[test]
    fn test_document_upsert_replaces() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_bank("b1").unwrap();

        let mut doc = Document {
            id: "doc-1".to_string(),
            bank_id: "b1".to_string(),
            original_text: "v1".to_string(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_document(&doc).unwrap();

        doc.original_text = "v2".to_string();
        store.upsert_document(&doc).unwrap();

        let fetched = store.get_document("b1", "doc-1").unwrap().unwrap();
        assert_eq!(fetched.original_text, "v2");
        assert_eq!(store.list_documents("b1").unwrap().len(), 1);
    }
}
