//! Storage layer.
//!
//! A single SQLite file holds every table of the data model, with FTS5 for
//! lexical search and embedding BLOB columns scanned with exact cosine for
//! vector search (per-bank corpora stay small enough that the scan is
//! bounded by the bank partition and fact-type predicates).
//!
//! Concurrency: a `Mutex<Connection>` with WAL mode and a busy timeout.
//! WAL allows concurrent readers with a single writer; the mutex serializes
//! statements from this process. Every query is bank-scoped - cross-bank
//! reads exist only on the administrative surface.

// Allow cast precision loss for score calculations where exact precision is not critical.
#![allow(clippy::cast_precision_loss)]
// Dropping database connections slightly early provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]

mod banks;
mod directives;
mod documents;
mod entities;
mod links;
mod operations;
mod reflections;
pub mod schema;
mod units;
pub mod vector;

use crate::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Transactional store for banks, units, links, entities, documents,
/// reflections, directives, and operations.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path and runs pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a migration fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::op("store_open", e))?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store. Used by tests and ephemeral deployments.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::op("store_open", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure_connection(&conn)?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquires the connection lock with poison recovery.
    ///
    /// If the mutex is poisoned by a panic in a previous critical section,
    /// the inner value is recovered and a warning logged so one panicking
    /// operation does not take the whole store down.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("SQLite mutex was poisoned, recovering");
                metrics::counter!("store_mutex_poison_recovery_total").increment(1);
                poisoned.into_inner()
            },
        }
    }
}

/// Configures a `SQLite` connection for concurrent read-heavy use.
///
/// - **WAL mode**: concurrent readers with a single writer
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: waits for locks instead of failing immediately
/// - **`foreign_keys`**: bank deletion cascades through every table
fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a string result which execute_batch would treat
    // as an error, so pragma_update results are ignored deliberately.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| Error::op("store_configure", e))?;
    Ok(())
}

/// Builds a `?,?,...` placeholder list for an `IN` clause.
pub(crate) fn sql_placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

/// Serializes an embedding as little-endian f32 bytes.
#[must_use]
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Deserializes little-endian f32 bytes back into an embedding.
#[must_use]
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| Error::op("parse_timestamp", format!("'{raw}': {e}")))
}

pub(crate) fn parse_json_field<T: serde::de::DeserializeOwned + Default>(
    raw: Option<String>,
) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}
