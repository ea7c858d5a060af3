//! Operation (async job) tracking.

use super::{parse_timestamp, SqliteStore};
use crate::models::{Operation, OperationStatus, OperationType};
use crate::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const OPERATION_COLUMNS: &str =
    "id, bank_id, op_type, status, created_at, started_at, finished_at, result, error";

fn row_to_operation(
    row: &Row<'_>,
) -> rusqlite::Result<(Operation, String, Option<String>, Option<String>)> {
    let op_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let started_at: Option<String> = row.get(5)?;
    let finished_at: Option<String> = row.get(6)?;
    let result: Option<String> = row.get(7)?;
    Ok((
        Operation {
            id: row.get(0)?,
            bank_id: row.get(1)?,
            op_type: OperationType::parse(&op_type).unwrap_or(OperationType::Retain),
            status: OperationStatus::parse(&status).unwrap_or(OperationStatus::Pending),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: result.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get(8)?,
        },
        created_at,
        started_at,
        finished_at,
    ))
}

impl SqliteStore {
    /// Creates a pending operation row and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn create_operation(&self, bank_id: &str, op_type: OperationType) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO operations (id, bank_id, op_type, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id, bank_id, op_type.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    /// Marks an operation as running.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn start_operation(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE operations SET status = 'running', started_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Marks an operation as completed with a result payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn complete_operation(&self, id: &str, result: &serde_json::Value) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE operations SET status = 'completed', finished_at = ?2, result = ?3
             WHERE id = ?1",
            params![id, Utc::now().to_rfc3339(), result.to_string()],
        )?;
        Ok(())
    }

    /// Marks an operation as failed with an error message.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn fail_operation(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE operations SET status = 'failed', finished_at = ?2, error = ?3
             WHERE id = ?1",
            params![id, Utc::now().to_rfc3339(), error],
        )?;
        Ok(())
    }

    /// Fetches an operation by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1"),
                params![id],
                row_to_operation,
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((mut operation, created_at, started_at, finished_at)) => {
                operation.created_at = parse_timestamp(&created_at)?;
                operation.started_at = started_at.as_deref().map(parse_timestamp).transpose()?;
                operation.finished_at =
                    finished_at.as_deref().map(parse_timestamp).transpose()?;
                Ok(Some(operation))
            },
        }
    }
}
