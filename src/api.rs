//! # Async API for QDB
//!
//! [`Qdb`] is the handle to one database: the thing a server mounts, and
//! the thing an application can also use directly without any socket in
//! between.
//!
//! ## Layout on Disk
//!
//! ```text
//! {data_dir}/
//! └── shop/
//!     ├── shop.db            ← SQLite (WAL mode, so also shop.db-wal/-shm)
//!     └── logs/
//!         └── data.jsonl     ← expiration log
//! ```
//!
//! ## The Table Cache
//!
//! Every handler needs to know whether a table exists before it builds SQL,
//! and asking SQLite each time would queue behind writes on the storage
//! thread. So each `Qdb` keeps a `BTreeMap` of [`TableDescriptor`]s behind a
//! `tokio::sync::RwLock`:
//!
//! - reads (GET, POST, PATCH, DELETE row) hold the read lock for the whole
//!   operation, so a table cannot be dropped underneath them;
//! - create and drop hold the write lock across the DDL *and* the cache
//!   update, so nobody ever sees the catalog and the cache disagree.
//!
//! The cache is loaded from the catalog at open and after each create, so
//! descriptors always describe what SQLite actually has.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::expiration::{ExpirationEntry, ExpirationLog, SweepReport};
use crate::query::{self, QueryOutput};
use crate::queue;
use crate::schema::{Database, SchemaBootstrap};
use crate::storage::{spawn_storage_engine, BatchStatement, StorageHandle};
use crate::types::{now_ms, ConflictPolicy, JobId, QueueItem, Row, TableDescriptor};
use crate::{Error, Result};

/// Rows of one table together with its primary key column.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    pub primary_key: Option<String>,
    pub rows: Vec<Row>,
}

/// A table created by [`Qdb::create_table`] and the seed rows as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedTable {
    pub table: TableDescriptor,
    pub rows: Vec<Row>,
}

/// Async handle to one database.
///
/// Cloning is cheap and every clone talks to the same storage thread and
/// shares the same table cache.
///
/// # Example
///
/// ```rust,no_run
/// use qdb::Qdb;
///
/// # async fn example() -> qdb::Result<()> {
/// let db = Qdb::open("shop", "db").await?;
/// for table in db.tables().await {
///     println!("{}", table.name);
/// }
/// db.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Qdb {
    inner: Arc<QdbInner>,
}

struct QdbInner {
    name: String,
    storage: StorageHandle,
    tables: RwLock<BTreeMap<String, TableDescriptor>>,
    expiration: Option<ExpirationLog>,
    engine: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Qdb {
    /// Opens `{dir}/{name}/{name}.db` with default configuration.
    pub async fn open(name: &str, dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(name, dir, &DatabaseConfig::default(), None).await
    }

    /// Opens a file-backed database, running `bootstrap` after the internal
    /// schema, and starts its expiration sweep.
    pub async fn open_with(
        name: &str,
        dir: impl AsRef<Path>,
        config: &DatabaseConfig,
        bootstrap: Option<&dyn SchemaBootstrap>,
    ) -> Result<Self> {
        check_database_name(name)?;
        let root = dir.as_ref().join(name);
        std::fs::create_dir_all(&root)?;

        let db = Database::open_with(root.join(format!("{name}.db")), bootstrap)?;
        let expiration = ExpirationLog::open(root.join("logs").join("data.jsonl"))?;

        let qdb = Self::start(name, db, config, Some(expiration)).await?;
        qdb.spawn_sweep_task(config.sweep_interval);
        info!(database = name, path = %root.display(), "database opened");
        Ok(qdb)
    }

    /// Opens a private in-memory database. No expiration log, no sweep.
    pub async fn open_in_memory(name: &str) -> Result<Self> {
        check_database_name(name)?;
        let db = Database::open_in_memory()?;
        Self::start(name, db, &DatabaseConfig::default(), None).await
    }

    async fn start(
        name: &str,
        db: Database,
        config: &DatabaseConfig,
        expiration: Option<ExpirationLog>,
    ) -> Result<Self> {
        let (storage, engine) = spawn_storage_engine(name, db.into_connection(), &config.storage)?;

        let tables = storage
            .call(|conn| query::list_tables(conn))
            .await?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        Ok(Self {
            inner: Arc::new(QdbInner {
                name: name.to_string(),
                storage,
                tables: RwLock::new(tables),
                expiration,
                engine: Mutex::new(Some(engine)),
                sweeper: Mutex::new(None),
            }),
        })
    }

    /// Runs the expiration sweep every `every`.
    ///
    /// The task holds a weak reference, so it stops by itself once the last
    /// handle is dropped.
    fn spawn_sweep_task(&self, every: Duration) {
        let weak: Weak<QdbInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let db = Qdb { inner };

                match db.sweep_expired().await {
                    Ok(report) if report.removed > 0 => {
                        info!(database = %db.name(), removed = report.removed, "expired rows deleted");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(database = %db.name(), error = %e, "expiration sweep failed"),
                }
            }
        });
        *self.inner.sweeper.lock() = Some(task);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The storage handle, for statements the table API does not cover.
    ///
    /// DDL run through here bypasses the table cache; call
    /// [`Qdb::refresh_tables`] afterwards.
    pub fn storage(&self) -> &StorageHandle {
        &self.inner.storage
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// All cached user tables, by name.
    pub async fn tables(&self) -> Vec<TableDescriptor> {
        self.inner.tables.read().await.values().cloned().collect()
    }

    pub async fn table(&self, name: &str) -> Option<TableDescriptor> {
        self.inner.tables.read().await.get(name).cloned()
    }

    pub async fn has_table(&self, name: &str) -> bool {
        self.inner.tables.read().await.contains_key(name)
    }

    /// Reloads the table cache from the catalog.
    pub async fn refresh_tables(&self) -> Result<()> {
        let mut tables = self.inner.tables.write().await;
        let fresh = self.inner.storage.call(|conn| query::list_tables(conn)).await?;
        *tables = fresh.into_iter().map(|t| (t.name.clone(), t)).collect();
        Ok(())
    }

    /// Every row of `table` plus its primary key column.
    pub async fn get_table_data(&self, table: &str) -> Result<TableData> {
        let tables = self.inner.tables.read().await;
        if !tables.contains_key(table) {
            return Err(Error::TableNotFound(table.to_string()));
        }

        let results = self
            .inner
            .storage
            .execute_many(vec![
                BatchStatement::new(query::select_sql(table)?, vec![]),
                BatchStatement::new(query::PRIMARY_KEY_SQL, vec![json!(table)]),
            ])
            .await;
        drop(tables);

        let [rows, primary_key]: [Result<QueryOutput>; 2] = results
            .try_into()
            .map_err(|_| Error::Schema("table read returned an unexpected result count".to_string()))?;

        let primary_key = primary_key?
            .into_rows()
            .into_iter()
            .next()
            .and_then(|row| row.get("name").and_then(Value::as_str).map(String::from));

        Ok(TableData {
            primary_key,
            rows: rows?.into_rows(),
        })
    }

    /// Creates a table and inserts `seed` into it, in one transaction.
    pub async fn create_table(
        &self,
        table: TableDescriptor,
        seed: Vec<Row>,
        policy: ConflictPolicy,
    ) -> Result<CreatedTable> {
        let mut tables = self.inner.tables.write().await;
        if tables.contains_key(&table.name) {
            return Err(Error::TableAlreadyExists(table.name));
        }
        // Name and column checks, before anything reaches the storage thread.
        query::create_table_sql(&table)?;

        let created = self
            .inner
            .storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                query::create_table(&tx, &table)?;
                let rows = if seed.is_empty() {
                    Vec::new()
                } else {
                    query::insert_rows(&tx, &table.name, &seed, policy)?
                };
                let described = query::describe_table(&tx, &table.name)?
                    .ok_or_else(|| Error::TableNotFound(table.name.clone()))?;
                tx.commit()?;
                Ok(CreatedTable {
                    table: described,
                    rows,
                })
            })
            .await?;

        tables.insert(created.table.name.clone(), created.table.clone());
        debug!(database = %self.name(), table = %created.table.name, seeded = created.rows.len(), "table created");
        Ok(created)
    }

    /// Inserts rows in one transaction and returns them as stored.
    pub async fn insert_data(&self, table: &str, rows: Vec<Row>, policy: ConflictPolicy) -> Result<Vec<Row>> {
        let tables = self.inner.tables.read().await;
        if !tables.contains_key(table) {
            return Err(Error::TableNotFound(table.to_string()));
        }
        if rows.is_empty() {
            return Err(Error::EmptyPayload);
        }

        let name = table.to_string();
        let stored = self
            .inner
            .storage
            .call(move |conn| query::insert_many(conn, &name, &rows, policy))
            .await;
        drop(tables);
        stored
    }

    /// Sets `changes` on the row whose primary key equals `key`.
    ///
    /// A table without a declared primary key is addressed by `rowid`.
    pub async fn update_by_key(&self, table: &str, key: &str, changes: Row) -> Result<Vec<Row>> {
        let tables = self.inner.tables.read().await;
        let filter = key_filter_for(&tables, table, key)?;

        let name = table.to_string();
        let updated = self
            .inner
            .storage
            .call(move |conn| query::update_where(conn, &name, &changes, &filter))
            .await;
        drop(tables);
        updated
    }

    /// Deletes the row whose primary key equals `key`; returns what was
    /// deleted (possibly nothing).
    pub async fn delete_by_key(&self, table: &str, key: &str) -> Result<Vec<Row>> {
        let tables = self.inner.tables.read().await;
        let filter = key_filter_for(&tables, table, key)?;

        let name = table.to_string();
        let deleted = self
            .inner
            .storage
            .call(move |conn| query::delete_where(conn, &name, &filter))
            .await;
        drop(tables);
        deleted
    }

    /// Drops a table.
    pub async fn delete_table(&self, table: &str) -> Result<()> {
        let mut tables = self.inner.tables.write().await;
        if !tables.contains_key(table) {
            return Err(Error::TableNotFound(table.to_string()));
        }

        let name = table.to_string();
        self.inner
            .storage
            .call(move |conn| query::drop_table(conn, &name))
            .await?;
        tables.remove(table);
        debug!(database = %self.name(), table, "table dropped");
        Ok(())
    }

    /// Drops every user table in one transaction; returns their names.
    ///
    /// The internal queue and metadata tables are left alone.
    pub async fn delete_all_tables(&self) -> Result<Vec<String>> {
        let mut tables = self.inner.tables.write().await;
        let names = drop_order(&tables);

        let to_drop = names.clone();
        self.inner
            .storage
            .call(move |conn| {
                let tx = conn.transaction()?;
                // Reference cycles are only consistent once every table is gone.
                tx.pragma_update(None, "defer_foreign_keys", true)?;
                for name in &to_drop {
                    query::drop_table(&tx, name)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        tables.clear();
        info!(database = %self.name(), dropped = names.len(), "all tables dropped");
        Ok(names)
    }

    // =========================================================================
    // Queue
    // =========================================================================

    pub async fn enqueue(&self, topic: &str, payload: Value, priority: i64) -> Result<JobId> {
        let topic = topic.to_string();
        self.inner
            .storage
            .call(move |conn| queue::enqueue(conn, &topic, &payload, priority))
            .await
    }

    pub async fn dequeue(&self, claimant: &str, topic: Option<&str>) -> Result<Option<QueueItem>> {
        let claimant = claimant.to_string();
        let topic = topic.map(String::from);
        self.inner
            .storage
            .call(move |conn| queue::dequeue(conn, &claimant, topic.as_deref()))
            .await
    }

    pub async fn ack(&self, id: &str) -> Result<QueueItem> {
        let id = id.to_string();
        self.inner.storage.call(move |conn| queue::ack(conn, &id)).await
    }

    pub async fn fail(&self, id: &str, reason: &str) -> Result<QueueItem> {
        let id = id.to_string();
        let reason = reason.to_string();
        self.inner
            .storage
            .call(move |conn| queue::fail(conn, &id, &reason))
            .await
    }

    pub async fn job(&self, id: &str) -> Result<Option<QueueItem>> {
        let id = id.to_string();
        self.inner.storage.call(move |conn| queue::get(conn, &id)).await
    }

    // =========================================================================
    // Expiration
    // =========================================================================

    /// Records that `rows` of `table` expire after `ttl`.
    ///
    /// Returns how many rows were recorded. In-memory databases and rows
    /// without a usable key value record nothing.
    pub async fn expire_rows(&self, table: &str, rows: &[Row], ttl: Duration) -> Result<usize> {
        let expires_at = expiry_deadline(ttl)?;
        let Some(log) = &self.inner.expiration else {
            return Ok(0);
        };
        let key_column = self
            .table(table)
            .await
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?
            .primary_key()
            .unwrap_or("rowid")
            .to_string();

        let entries: Vec<ExpirationEntry> = rows
            .iter()
            .filter_map(|row| row.get(&key_column).and_then(query::key_text))
            .map(|id| ExpirationEntry {
                id,
                table: table.to_string(),
                expires_at,
            })
            .collect();

        log.append(&entries).await?;
        Ok(entries.len())
    }

    /// Deletes rows whose expiration has passed.
    ///
    /// Entries for tables that no longer exist count as removed.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let Some(log) = &self.inner.expiration else {
            return Ok(SweepReport::default());
        };

        log.sweep(now_ms(), |entry| {
            let db = self.clone();
            async move {
                match db.delete_by_key(&entry.table, &entry.id).await {
                    Ok(_) | Err(Error::TableNotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops the sweep task and the storage thread, waiting for queued
    /// statements to finish.
    ///
    /// Every clone is affected: later calls fail with
    /// [`Error::StorageClosed`].
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        self.inner.storage.shutdown().await;

        let engine = self.inner.engine.lock().take();
        if let Some(engine) = engine {
            let joined = tokio::task::spawn_blocking(move || engine.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(database = %self.name(), "storage thread did not exit cleanly");
            }
        }
        info!(database = %self.name(), "database closed");
    }
}

fn key_filter_for(tables: &BTreeMap<String, TableDescriptor>, table: &str, key: &str) -> Result<Row> {
    let descriptor = tables
        .get(table)
        .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
    Ok(query::key_filter(descriptor.primary_key().unwrap_or("rowid"), key))
}

/// Table names ordered so that referencing tables come before the tables
/// they reference. Tables caught in a reference cycle are appended in name
/// order.
fn drop_order(tables: &BTreeMap<String, TableDescriptor>) -> Vec<String> {
    let mut remaining: Vec<&TableDescriptor> = tables.values().collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let referenced_by_others = |name: &str| {
            remaining.iter().any(|other| {
                other.name != name
                    && other
                        .columns
                        .iter()
                        .filter_map(|c| c.foreign_key.as_ref())
                        .any(|fk| fk.table == name)
            })
        };
        let ready: Vec<String> = remaining
            .iter()
            .filter(|t| !referenced_by_others(t.name.as_str()))
            .map(|t| t.name.clone())
            .collect();

        if ready.is_empty() {
            order.extend(remaining.drain(..).map(|t| t.name.clone()));
            break;
        }
        remaining.retain(|t| !ready.contains(&t.name));
        order.extend(ready);
    }
    order
}

/// Absolute expiry time for a row stored now with `ttl`.
///
/// # Errors
///
/// [`Error::MalformedMessage`] if the deadline does not fit in milliseconds
/// since the epoch.
pub fn expiry_deadline(ttl: Duration) -> Result<i64> {
    i64::try_from(ttl.as_millis())
        .ok()
        .and_then(|ttl| now_ms().checked_add(ttl))
        .ok_or_else(|| Error::MalformedMessage(format!("ttl {}ms is out of range", ttl.as_millis())))
}

/// Database names become directory and file names.
fn check_database_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid database name '{name}'")))
    }
}

// =============================================================================
// Tests
// =============================================================================
