//! # Job Queue Engine
//!
//! A durable work queue stored in the internal `qdb_queue` table of each
//! database.
//!
//! ## State Machine
//!
//! ```text
//! enqueue ──► Pending ──dequeue──► Processing ──ack──► Done
//!                                      │
//!                                      └──fail──► Failed
//! ```
//!
//! Every other transition is rejected with [`Error::InvalidTransition`].
//!
//! ## Claiming
//!
//! `dequeue` is one statement:
//!
//! ```sql
//! UPDATE qdb_queue SET status = 'processing', ...
//! WHERE id = (SELECT id ... WHERE status = 'pending'
//!             ORDER BY priority DESC, created_ms ASC, id ASC LIMIT 1)
//!   AND status = 'pending'
//! RETURNING ...
//! ```
//!
//! SQLite takes the write lock before evaluating the subquery, so two
//! claimants can never pick the same row, even from different connections.
//! The trailing `status = 'pending'` re-check keeps the statement correct if
//! it is ever run outside that guarantee.

use rusqlite::{params, Connection, OptionalExtension, Row as SqlRow};
use serde_json::Value;

use crate::types::{now_ms, JobId, QueueItem, QueueStatus};
use crate::{Error, Result};

const ITEM_COLUMNS: &str =
    "id, topic, payload, status, priority, claimed_by, error, created_ms, updated_ms";

/// A queue row as stored, before the status and payload text are parsed.
struct StoredItem {
    id: String,
    topic: String,
    payload: String,
    status: String,
    priority: i64,
    claimed_by: Option<String>,
    error: Option<String>,
    created_ms: i64,
    updated_ms: i64,
}

impl StoredItem {
    fn from_row(row: &SqlRow<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            claimed_by: row.get(5)?,
            error: row.get(6)?,
            created_ms: row.get(7)?,
            updated_ms: row.get(8)?,
        })
    }

    fn into_item(self) -> Result<QueueItem> {
        Ok(QueueItem {
            id: JobId::new(self.id),
            topic: self.topic,
            payload: serde_json::from_str(&self.payload)?,
            status: QueueStatus::parse(&self.status)?,
            priority: self.priority,
            claimed_by: self.claimed_by,
            error: self.error,
            created_ms: self.created_ms,
            updated_ms: self.updated_ms,
        })
    }
}

/// Adds an item. Higher `priority` is claimed first.
pub fn enqueue(conn: &Connection, topic: &str, payload: &Value, priority: i64) -> Result<JobId> {
    enqueue_at(conn, topic, payload, priority, now_ms())
}

/// [`enqueue`] with an explicit creation time.
pub fn enqueue_at(
    conn: &Connection,
    topic: &str,
    payload: &Value,
    priority: i64,
    created_ms: i64,
) -> Result<JobId> {
    let id = JobId::generate();
    conn.execute(
        "INSERT INTO qdb_queue (id, topic, payload, status, priority, created_ms, updated_ms)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
        params![id.as_str(), topic, payload.to_string(), priority, created_ms],
    )?;
    Ok(id)
}

/// Claims the next pending item for `claimant`, optionally restricted to one
/// topic. `None` when nothing is pending.
pub fn dequeue(conn: &Connection, claimant: &str, topic: Option<&str>) -> Result<Option<QueueItem>> {
    let sql = format!(
        "UPDATE qdb_queue
         SET status = 'processing', claimed_by = ?1, updated_ms = ?2
         WHERE id = (
             SELECT id FROM qdb_queue
             WHERE status = 'pending' AND (?3 IS NULL OR topic = ?3)
             ORDER BY priority DESC, created_ms ASC, id ASC
             LIMIT 1
         )
         AND status = 'pending'
         RETURNING {ITEM_COLUMNS}"
    );

    let claimed = conn
        .query_row(&sql, params![claimant, now_ms(), topic], StoredItem::from_row)
        .optional()?;
    claimed.map(StoredItem::into_item).transpose()
}

/// Looks up an item by id.
pub fn get(conn: &Connection, id: &str) -> Result<Option<QueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM qdb_queue WHERE id = ?1");
    let found = conn.query_row(&sql, [id], StoredItem::from_row).optional()?;
    found.map(StoredItem::into_item).transpose()
}

/// `Processing -> Done`.
pub fn ack(conn: &Connection, id: &str) -> Result<QueueItem> {
    complete(conn, id, QueueStatus::Done, None)
}

/// `Processing -> Failed`, recording `reason`.
pub fn fail(conn: &Connection, id: &str, reason: &str) -> Result<QueueItem> {
    complete(conn, id, QueueStatus::Failed, Some(reason))
}

fn complete(conn: &Connection, id: &str, to: QueueStatus, reason: Option<&str>) -> Result<QueueItem> {
    let sql = format!(
        "UPDATE qdb_queue SET status = ?2, error = ?3, updated_ms = ?4
         WHERE id = ?1 AND status = 'processing'
         RETURNING {ITEM_COLUMNS}"
    );
    let updated = conn
        .query_row(&sql, params![id, to.as_str(), reason, now_ms()], StoredItem::from_row)
        .optional()?;

    match updated {
        Some(stored) => stored.into_item(),
        None => match get(conn, id)? {
            None => Err(Error::QueueItemNotFound(id.to_string())),
            Some(item) => Err(Error::InvalidTransition {
                id: id.to_string(),
                from: item.status,
                to,
            }),
        },
    }
}
