//! Directive persistence.

use super::{parse_json_field, parse_timestamp, SqliteStore};
use crate::models::{Directive, TagMatch};
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};

const DIRECTIVE_COLUMNS: &str =
    "id, bank_id, name, content, priority, is_active, tags, created_at";

fn row_to_directive(row: &Row<'_>) -> rusqlite::Result<(Directive, String)> {
    let tags: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok((
        Directive {
            id: row.get(0)?,
            bank_id: row.get(1)?,
            name: row.get(2)?,
            content: row.get(3)?,
            priority: row.get(4)?,
            is_active: row.get::<_, i64>(5)? != 0,
            tags: parse_json_field(tags),
            created_at: chrono::Utc::now(),
        },
        created_at,
    ))
}

impl SqliteStore {
    /// Inserts or updates a directive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a negative priority, or a
    /// storage error.
    pub fn upsert_directive(&self, directive: &Directive) -> Result<()> {
        if directive.priority < 0 {
            return Err(Error::InvalidInput(format!(
                "directive priority must be non-negative, got {}",
                directive.priority
            )));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO directives
                 (id, bank_id, name, content, priority, is_active, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 content = excluded.content,
                 priority = excluded.priority,
                 is_active = excluded.is_active,
                 tags = excluded.tags",
            params![
                directive.id,
                directive.bank_id,
                directive.name,
                directive.content,
                directive.priority,
                i64::from(directive.is_active),
                serde_json::to_string(&directive.tags)
                    .map_err(|e| Error::op("serialize_directive_tags", e))?,
                directive.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetches a directive by id within a bank.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_directive(&self, bank_id: &str, id: &str) -> Result<Option<Directive>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {DIRECTIVE_COLUMNS} FROM directives
                     WHERE bank_id = ?1 AND id = ?2"
                ),
                params![bank_id, id],
                row_to_directive,
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((mut directive, created_at)) => {
                directive.created_at = parse_timestamp(&created_at)?;
                Ok(Some(directive))
            },
        }
    }

    /// Lists a bank's directives, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_directives(&self, bank_id: &str) -> Result<Vec<Directive>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DIRECTIVE_COLUMNS} FROM directives
             WHERE bank_id = ?1 ORDER BY priority DESC, created_at ASC"
        ))?;
        let rows = stmt.query_map(params![bank_id], row_to_directive)?;
        let mut directives = Vec::new();
        for row in rows {
            let (mut directive, created_at) = row?;
            directive.created_at = parse_timestamp(&created_at)?;
            directives.push(directive);
        }
        Ok(directives)
    }

    /// Deletes a directive. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete_directive(&self, bank_id: &str, id: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM directives WHERE bank_id = ?1 AND id = ?2",
            params![bank_id, id],
        )?;
        Ok(deleted > 0)
    }

    /// Active directives for a reflect call, tag-filtered, highest priority
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn active_directives(&self, bank_id: &str, tags: &[String]) -> Result<Vec<Directive>> {
        Ok(self
            .list_directives(bank_id)?
            .into_iter()
            .filter(|d| d.is_active && TagMatch::Any.matches(tags, &d.tags))
            .collect())
    }
}
