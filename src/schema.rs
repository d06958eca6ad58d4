//! # SQLite Schema for QDB
//!
//! Every mounted database is one SQLite file. User tables are created at
//! runtime through PUT messages; this module only owns the internal tables
//! that exist in every file, and the pragmas every connection runs with.
//!
//! ## Table Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Internal Tables                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  qdb_metadata          qdb_queue                              │
//! │  ┌──────────┐          ┌─────────────────┐                    │
//! │  │ key (PK) │          │ id (PK)         │                    │
//! │  │ value    │          │ topic           │                    │
//! │  └──────────┘          │ payload (JSON)  │                    │
//! │                        │ status          │◄── claim index     │
//! │                        │ priority        │                    │
//! │                        │ claimed_by      │                    │
//! │                        │ error           │                    │
//! │                        │ created_ms      │                    │
//! │                        │ updated_ms      │                    │
//! │                        └─────────────────┘                    │
//! │                                                               │
//! │  user tables: anything else not prefixed sqlite_ / qdb_       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `qdb_` prefix is deny-listed for user tables (see `query`), so clients
//! can never reach the queue through table CRUD.
//!
//! ## Bootstrap Hook
//!
//! [`SchemaBootstrap`] is the seam for seeding extra tables at mount time.
//! [`CoreSchema`] is always applied first; a custom bootstrap runs after it
//! in the same open call.

use std::path::Path;

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current internal schema version. Increment when the internal tables change.
const SCHEMA_VERSION: i32 = 1;

/// How long a statement waits on a locked file before failing with BUSY.
const BUSY_TIMEOUT_MS: u32 = 5_000;

// =============================================================================
// DDL Statements
// =============================================================================

/// Key/value metadata, currently just `schema_version`.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS qdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// The job queue.
///
/// # Columns
///
/// - `id`: 32 lowercase hex chars, random
/// - `payload`: JSON text, returned to the claimant as-is
/// - `status`: `pending`, `processing`, `done` or `failed`
/// - `priority`: higher is claimed first
/// - `claimed_by`: set by dequeue
/// - `error`: reason recorded by fail
const CREATE_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS qdb_queue (
    id          TEXT PRIMARY KEY,
    topic       TEXT NOT NULL,
    payload     TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending',
    priority    INTEGER NOT NULL DEFAULT 0,
    claimed_by  TEXT,
    error       TEXT,
    created_ms  INTEGER NOT NULL,
    updated_ms  INTEGER NOT NULL
)
"#;

/// Supports the claim query: `WHERE status = 'pending' ORDER BY priority DESC,
/// created_ms, id`.
const CREATE_QUEUE_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS qdb_queue_claim
ON qdb_queue(status, priority DESC, created_ms, id)
"#;

// =============================================================================
// Bootstrap
// =============================================================================

/// Seeds a freshly opened connection.
///
/// Implementations must be idempotent: `setup` runs on every open, not just
/// the first.
pub trait SchemaBootstrap: Send + Sync {
    fn setup(&self, conn: &Connection) -> Result<()>;
}

/// Creates the internal metadata and queue tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreSchema;

impl SchemaBootstrap for CoreSchema {
    fn setup(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(CREATE_METADATA)?;
        conn.execute_batch(CREATE_QUEUE)?;
        conn.execute_batch(CREATE_QUEUE_CLAIM_INDEX)?;
        Ok(())
    }
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the internal schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection` until [`Database::into_connection`] hands
/// it to the storage thread. After that, only that thread touches it.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// ```rust,no_run
    /// use qdb::Database;
    ///
    /// let db = Database::open("shop.db")?;
    /// # Ok::<(), qdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, None)
    }

    /// Like [`Database::open`], running `bootstrap` after the core schema.
    pub fn open_with(path: impl AsRef<Path>, bootstrap: Option<&dyn SchemaBootstrap>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(bootstrap)?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(None)?;
        Ok(db)
    }

    fn initialize(&mut self, bootstrap: Option<&dyn SchemaBootstrap>) -> Result<()> {
        // =====================================================================
        // Pragmas
        // =====================================================================

        // In-memory databases answer "memory" here and that is fine.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;
        self.conn
            .busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;

        // =====================================================================
        // Tables
        // =====================================================================

        CoreSchema.setup(&self.conn)?;
        if let Some(extra) = bootstrap {
            extra.setup(&self.conn)?;
        }

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM qdb_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .ok();

        match existing.map(|s| s.parse::<i32>()) {
            None => {
                self.conn.execute(
                    "INSERT INTO qdb_metadata (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(Ok(v)) if v == SCHEMA_VERSION => {}
            Some(Ok(v)) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this QDB version requires {SCHEMA_VERSION}"
                )));
            }
            Some(Err(_)) => {
                return Err(Error::Schema("schema version is not a number".to_string()));
            }
        }

        Ok(())
    }

    /// Hands the connection over, typically to the storage thread.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
