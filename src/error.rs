//! # Error Handling for QDB
//!
//! This module defines the error types used throughout QDB. A single error enum
//! ([`Error`]) covers every failure mode, from a malformed route to a SQLite
//! constraint violation.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! The `#[error(...)]` attributes double as the wire text: whatever `Display`
//! prints is exactly what a client sees in the `error` field of a response.
//! That makes the messages part of the protocol, so the tests pin them.
//!
//! ## Error Categories
//!
//! | Category | Examples | What the client sees |
//! |----------|----------|----------------------|
//! | Addressing | `InvalidRoute`, `DatabaseNotFound`, `RouteNotFound` | `{success:false, error}` |
//! | Schema | `TableNotFound`, `TableAlreadyExists`, `NameNotAllowed` | `{success:false, error}` |
//! | Protocol | `UnsupportedMethod`, `EmptyPayload`, `MalformedMessage` | `{success:false, error}` |
//! | Queue | `InvalidTransition`, `QueueItemNotFound` | `{success:false, error}` |
//! | Internal | `Sqlite`, `Io`, `Json`, `StorageClosed` | `{success:false, error}` plus a log line |
//!
//! None of these close the connection. Only a transport failure does that.

use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{IdentifierKind, QueueStatus};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in QDB operations.
///
/// # Example
///
/// ```rust
/// use qdb::Error;
///
/// let err = Error::TableNotFound("orders".to_string());
/// assert_eq!(
///     err.to_string(),
///     "Table 'orders' does not exist, Please create the table first"
/// );
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Addressing Errors
    // =========================================================================

    /// The route has no database segment, or an operation needs a segment the
    /// route does not carry.
    #[error("Invalid Query, Query must be like this: '{{database}}/{{table}}' or '{{database}}/{{table}}/{{primary_key}}'")]
    InvalidRoute,

    /// No database is mounted under the requested path.
    #[error("Database '{0}' not found")]
    DatabaseNotFound(String),

    /// A database is already mounted under this path.
    ///
    /// Mounting never replaces an existing tenant. Unmount first.
    #[error("Database '{0}' is already mounted")]
    DatabaseAlreadyMounted(String),

    /// Segment 1 names neither a table nor a route alias.
    #[error("Route of '{0}' is not associated with any table or alias, Try creating a table or alias for '{0}'")]
    RouteNotFound(String),

    // =========================================================================
    // Schema Errors
    // =========================================================================

    /// The table is not in the cached catalog.
    #[error("Table '{0}' does not exist, Please create the table first")]
    TableNotFound(String),

    /// PUT on a table that already exists.
    #[error("Table '{0}' already exists")]
    TableAlreadyExists(String),

    /// A keyed GET against a table without rows.
    #[error("Table '{0}' is empty")]
    TableEmpty(String),

    /// A table or column name hit the deny-list or is not a plain identifier.
    #[error("{kind} name '{name}' is not allowed, Please use a different name")]
    NameNotAllowed {
        /// Whether the rejected name was a table or a column
        kind: IdentifierKind,
        /// The rejected name
        name: String,
    },

    // =========================================================================
    // Protocol Errors
    // =========================================================================

    /// The method is outside the closed set.
    #[error("Unsupported method type, try using GET, POST, PUT, DELETE, PATCH or ALL")]
    UnsupportedMethod(String),

    /// A write that needs rows was sent without any.
    #[error("No data provided, Please provide data to insert into the table")]
    EmptyPayload,

    /// The message parsed as JSON but is missing something the operation needs.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    // =========================================================================
    // Queue Errors
    // =========================================================================

    /// ack/fail on an item that is not currently claimed.
    #[error("queue item '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The queue item id
        id: String,
        /// The status the item is actually in
        from: QueueStatus,
        /// The status the caller asked for
        to: QueueStatus,
    },

    /// No queue item with this id exists.
    #[error("queue item '{0}' not found")]
    QueueItemNotFound(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// `#[from]` generates `impl From<rusqlite::Error> for Error`, so `?` on any
    /// rusqlite call converts automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure (database directory, expiration log).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch or a corrupt internal table.
    #[error("schema error: {0}")]
    Schema(String),

    /// An environment variable could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The storage thread for a database has stopped.
    #[error("storage engine for '{0}' has shut down")]
    StorageClosed(String),
}

impl Error {
    /// Shorthand for a rejected table name.
    pub fn table_not_allowed(name: impl Into<String>) -> Self {
        Error::NameNotAllowed {
            kind: IdentifierKind::Table,
            name: name.into(),
        }
    }

    /// Shorthand for a rejected column name.
    pub fn column_not_allowed(name: impl Into<String>) -> Self {
        Error::NameNotAllowed {
            kind: IdentifierKind::Column,
            name: name.into(),
        }
    }

    /// Returns true for failures the client caused.
    ///
    /// The router logs internal failures at `warn` and everything else at
    /// `debug`.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Error::Sqlite(_)
                | Error::Io(_)
                | Error::Json(_)
                | Error::Schema(_)
                | Error::Config(_)
                | Error::StorageClosed(_)
        )
    }

    /// Converts the error into the outbound failure envelope.
    ///
    /// ```rust
    /// use qdb::Error;
    ///
    /// let body = Error::EmptyPayload.to_response();
    /// assert_eq!(body["success"], false);
    /// assert_eq!(body["data"], serde_json::json!({}));
    /// ```
    pub fn to_response(&self) -> Value {
        json!({
            "success": false,
            "data": {},
            "error": self.to_string(),
        })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// The messages are wire text, so they are pinned exactly.
    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::DatabaseNotFound("shop".to_string()).to_string(),
            "Database 'shop' not found"
        );
        assert_eq!(
            Error::TableAlreadyExists("orders".to_string()).to_string(),
            "Table 'orders' already exists"
        );
        assert_eq!(
            Error::TableEmpty("orders".to_string()).to_string(),
            "Table 'orders' is empty"
        );
        assert_eq!(
            Error::table_not_allowed("sqlite_master").to_string(),
            "Table name 'sqlite_master' is not allowed, Please use a different name"
        );
        assert_eq!(
            Error::column_not_allowed("select").to_string(),
            "Column name 'select' is not allowed, Please use a different name"
        );
        assert_eq!(
            Error::RouteNotFound("reports".to_string()).to_string(),
            "Route of 'reports' is not associated with any table or alias, Try creating a table or alias for 'reports'"
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::InvalidTransition {
            id: "abc".to_string(),
            from: QueueStatus::Pending,
            to: QueueStatus::Done,
        };
        assert_eq!(
            err.to_string(),
            "queue item 'abc' cannot move from pending to done"
        );
    }

    /// # Rust Pattern: From Trait
    ///
    /// The `#[from]` attribute on `Error::Sqlite` generates a `From` impl,
    /// allowing `?` to convert rusqlite errors to our Error type.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(!our_err.is_client_error());
    }

    #[test]
    fn test_to_response_shape() {
        let body = Error::UnsupportedMethod("FETCH".to_string()).to_response();

        assert_eq!(body["success"], false);
        assert_eq!(body["data"], json!({}));
        assert_eq!(
            body["error"],
            "Unsupported method type, try using GET, POST, PUT, DELETE, PATCH or ALL"
        );
    }
}
