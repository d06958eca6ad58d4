//! # Storage Engine Actor
//!
//! Each mounted database gets one dedicated OS thread that owns its SQLite
//! `Connection`. Async code never touches the connection directly; it sends a
//! closure over a channel and awaits the answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   StorageRequest    ┌─────────────────────────┐
//! │ router / Qdb   │────────────────────►│  qdb-storage-{name}     │
//! │ (tokio tasks)  │   (mpsc, bounded)   │  (std::thread)          │
//! │                │◄────────────────────│  owns rusqlite::Connection│
//! └────────────────┘   oneshot reply     └─────────────────────────┘
//! ```
//!
//! ## Why a Thread?
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, and every call blocks.
//! Running it on its own thread keeps blocking I/O off the tokio workers and
//! gives a natural total order: statements for one database execute one at a
//! time, in the order they were submitted.
//!
//! A claim (`queue::dequeue`) is a single statement, so it is atomic here
//! regardless; the ordering matters for things like create-table followed by
//! an insert from the same connection.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::query::{self, QueryOutput};
use crate::{Error, Result};

/// Work shipped to the storage thread.
type Job = Box<dyn FnOnce(&mut Connection) + Send>;

/// Requests understood by the storage thread.
enum StorageRequest {
    /// Run a closure against the connection.
    Call(Job),
    /// Stop after the requests already queued.
    Shutdown,
}

/// One statement in an [`StorageHandle::execute_many`] batch.
#[derive(Debug, Clone)]
pub struct BatchStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Wait this long before submitting the statement.
    pub delay: Option<Duration>,
}

impl BatchStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Async handle to a storage thread.
///
/// Cloning is cheap; all clones feed the same thread.
#[derive(Clone)]
pub struct StorageHandle {
    name: Arc<str>,
    tx: mpsc::Sender<StorageRequest>,
}

impl StorageHandle {
    /// Name of the database this handle serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` on the storage thread and returns its result.
    ///
    /// # Rust Pattern: Boxed FnOnce
    ///
    /// The closure is generic here but the channel carries one concrete type,
    /// so it is wrapped in a `Box<dyn FnOnce>` that forwards the typed result
    /// through a oneshot. The caller gets `R` back without the thread knowing
    /// what `R` is.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // The caller may have gone away; nothing to do then.
            let _ = response_tx.send(f(conn));
        });

        self.tx
            .send(StorageRequest::Call(job))
            .await
            .map_err(|_| Error::StorageClosed(self.name.to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::StorageClosed(self.name.to_string()))?
    }

    /// Runs one SQL statement with bound parameters.
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<QueryOutput> {
        let sql = sql.into();
        self.call(move |conn| query::execute(conn, &sql, &params)).await
    }

    /// Runs several independent statements.
    ///
    /// Items with a delay are submitted after it elapses; the others go out
    /// immediately. Results come back in input order. There is no batch-wide
    /// transaction: one failing item does not undo the others. Dropping the
    /// returned future cancels every item not yet submitted.
    pub async fn execute_many(&self, batch: Vec<BatchStatement>) -> Vec<Result<QueryOutput>> {
        let pending = batch.into_iter().map(|stmt| async move {
            if let Some(delay) = stmt.delay {
                tokio::time::sleep(delay).await;
            }
            self.execute(stmt.sql, stmt.params).await
        });
        futures::future::join_all(pending).await
    }

    /// Asks the thread to stop once queued requests are done.
    pub async fn shutdown(&self) {
        if self.tx.send(StorageRequest::Shutdown).await.is_err() {
            debug!(database = %self.name, "storage thread already stopped");
        }
    }
}

// =============================================================================
// Thread
// =============================================================================

/// Spawns the storage thread for `conn`.
///
/// Returns the handle and the thread's join handle. The thread exits on
/// [`StorageHandle::shutdown`] or when every handle has been dropped.
pub fn spawn_storage_engine(
    name: &str,
    conn: Connection,
    config: &StorageConfig,
) -> Result<(StorageHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(config.channel_size);
    let thread_name = format!("qdb-storage-{name}");
    let db_name: Arc<str> = Arc::from(name);
    let log_name = Arc::clone(&db_name);

    let join = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_storage_engine(&log_name, conn, rx))?;

    Ok((StorageHandle { name: db_name, tx }, join))
}

fn run_storage_engine(name: &str, mut conn: Connection, mut rx: mpsc::Receiver<StorageRequest>) {
    debug!(database = name, "storage thread started");

    while let Some(request) = rx.blocking_recv() {
        match request {
            StorageRequest::Call(job) => job(&mut conn),
            StorageRequest::Shutdown => break,
        }
    }

    if let Err((_, e)) = conn.close() {
        warn!(database = name, error = %e, "failed to close connection cleanly");
    }
    debug!(database = name, "storage thread stopped");
}

// =============================================================================
// Tests
// =============================================================================
