//! Embedded schema migrations.
//!
//! Compile-time embedded, versioned, applied transactionally at open.
//! Evolution is one-way forward; downgrades may drop data.

use crate::{Error, Result};
use rusqlite::Connection;

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply; may contain multiple statements.
    pub sql: &'static str,
}

/// All migrations, in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core schema: banks, units, links, entities, documents, operations",
        sql: r"
            CREATE TABLE IF NOT EXISTS banks (
                bank_id TEXT PRIMARY KEY,
                name TEXT,
                mission TEXT,
                skepticism REAL NOT NULL DEFAULT 0.5,
                literalism REAL NOT NULL DEFAULT 0.5,
                empathy REAL NOT NULL DEFAULT 0.5,
                bias_strength REAL NOT NULL DEFAULT 0.5,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT NOT NULL,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                original_text TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (bank_id, id)
            );

            CREATE TABLE IF NOT EXISTS memory_units (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                text TEXT NOT NULL,
                fact_type TEXT NOT NULL,
                context TEXT,
                created_at TEXT NOT NULL,
                event_date TEXT NOT NULL,
                occurred_start TEXT,
                occurred_end TEXT,
                mentioned_at TEXT,
                document_id TEXT,
                embedding BLOB NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                proof_count INTEGER,
                source_memory_ids TEXT,
                history TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_units_bank_created
                ON memory_units(bank_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_units_bank_event
                ON memory_units(bank_id, event_date);
            CREATE INDEX IF NOT EXISTS idx_units_document
                ON memory_units(bank_id, document_id)
                WHERE document_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                canonical_name TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                embedding BLOB NOT NULL,
                aliases TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                UNIQUE (bank_id, normalized_name, entity_type)
            );

            CREATE TABLE IF NOT EXISTS unit_entities (
                unit_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                PRIMARY KEY (unit_id, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_unit_entities_entity
                ON unit_entities(entity_id);

            CREATE TABLE IF NOT EXISTS memory_links (
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                from_unit TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
                to_unit TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
                link_type TEXT NOT NULL,
                entity_id TEXT NOT NULL DEFAULT '',
                weight REAL NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (from_unit, to_unit, link_type, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_links_from ON memory_links(from_unit);
            CREATE INDEX IF NOT EXISTS idx_links_to ON memory_links(to_unit);

            CREATE TABLE IF NOT EXISTS directives (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_directives_bank
                ON directives(bank_id, priority);

            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                op_type TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                result TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_operations_bank
                ON operations(bank_id, created_at);

            CREATE VIRTUAL TABLE IF NOT EXISTS memory_units_fts USING fts5(
                text,
                content='memory_units',
                content_rowid='rowid'
            );
            CREATE TRIGGER IF NOT EXISTS memory_units_fts_insert
            AFTER INSERT ON memory_units BEGIN
                INSERT INTO memory_units_fts(rowid, text) VALUES (new.rowid, new.text);
            END;
            CREATE TRIGGER IF NOT EXISTS memory_units_fts_delete
            AFTER DELETE ON memory_units BEGIN
                INSERT INTO memory_units_fts(memory_units_fts, rowid, text)
                    VALUES ('delete', old.rowid, old.text);
            END;
            CREATE TRIGGER IF NOT EXISTS memory_units_fts_update
            AFTER UPDATE OF text ON memory_units BEGIN
                INSERT INTO memory_units_fts(memory_units_fts, rowid, text)
                    VALUES ('delete', old.rowid, old.text);
                INSERT INTO memory_units_fts(rowid, text) VALUES (new.rowid, new.text);
            END;
        ",
    },
    Migration {
        version: 2,
        description: "reflections with full reflect response payloads",
        sql: r"
            CREATE TABLE IF NOT EXISTS reflections (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                source_query TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                reflect_response TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reflections_bank
                ON reflections(bank_id, created_at);
        ",
    },
    Migration {
        version: 3,
        description: "consolidation watermark and mental-model scan indices",
        sql: r"
            ALTER TABLE memory_units ADD COLUMN consolidated_at TEXT;
            CREATE INDEX IF NOT EXISTS idx_units_unconsolidated
                ON memory_units(bank_id, created_at)
                WHERE consolidated_at IS NULL
                  AND fact_type IN ('experience', 'world');
            CREATE INDEX IF NOT EXISTS idx_units_mental_model
                ON memory_units(bank_id, fact_type)
                WHERE fact_type = 'mental_model';
        ",
    },
];

/// Runs all pending migrations against the connection.
///
/// Each migration is applied inside a transaction together with its version
/// record, so a failing statement leaves the schema at the previous
/// version.
///
/// # Errors
///
/// Returns an error if a migration statement fails.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
    )
    .map_err(|e| Error::op("create_migrations_table", e))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(conn, migration)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute_batch("BEGIN")
        .map_err(|e| Error::op(format!("migration_v{}_begin", migration.version), e))?;

    let applied = conn
        .execute_batch(migration.sql)
        .and_then(|()| {
            conn.execute(
                "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
                rusqlite::params![migration.version, migration.description],
            )
            .map(|_| ())
        });

    match applied {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| Error::op(format!("migration_v{}_commit", migration.version), e))?;
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "Applied migration"
            );
            Ok(())
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(Error::op(
                format!("migration_v{}: {}", migration.version, migration.description),
                e,
            ))
        },
    }
}

/// Maximum version across a set of migrations.
#[must_use]
pub fn max_version(migrations: &[Migration]) -> i32 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}
