//! # Domain Types for QDB
//!
//! This module defines the core types shared by every layer: table and column
//! descriptors, the closed set of protocol methods, queue items and the small
//! identifier newtypes.
//!
//! ## Design Philosophy: Closed Enums at the Edge
//!
//! Everything that arrives as a string over the wire (`"GET"`, `"PRIMARY KEY"`,
//! `"subscribe"`) is parsed into an enum as early as possible. An unknown
//! method is rejected with [`Error::UnsupportedMethod`] before any handler
//! runs, and nothing past the router ever matches on raw strings.
//!
//! ## Rows
//!
//! A [`Row`] is a JSON object keyed by column name. The query layer converts
//! between `serde_json::Value` and SQLite values; see `query::to_sql_value`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// One table row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

// =============================================================================
// Identifiers
// =============================================================================

/// Which kind of identifier a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Table,
    Column,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierKind::Table => write!(f, "Table"),
            IdentifierKind::Column => write!(f, "Column"),
        }
    }
}

/// Server-assigned identifier of one client connection.
///
/// # Rust Pattern: Copy
///
/// A `u64` newtype is as cheap to copy as the integer itself, so it derives
/// `Copy` and is passed by value everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of a queue item: 128 random bits as 32 lowercase hex chars.
///
/// # Example
///
/// ```rust
/// use qdb::types::JobId;
///
/// let id = JobId::generate();
/// assert_eq!(id.as_str().len(), 32);
/// assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps an existing id, e.g. one read back from storage.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Table Schema
// =============================================================================

/// Declared SQL type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Integer,
    Text,
    Real,
    Boolean,
    Date,
    Time,
    Datetime,
    Blob,
    Float,
    Double,
    Decimal,
    Varchar,
    Char,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::Datetime => "DATETIME",
            ColumnType::Blob => "BLOB",
            ColumnType::Float => "FLOAT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Char => "CHAR",
        }
    }

    /// Maps a type declared in `sqlite_master` back to a column type.
    ///
    /// SQLite keeps whatever text the table was created with, including
    /// things like `VARCHAR(255)`. Only the leading word matters here, and an
    /// unknown or empty declaration reads back as TEXT.
    pub fn from_declared(declared: &str) -> Self {
        let head = declared
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match head.as_str() {
            "INTEGER" | "INT" | "BIGINT" => ColumnType::Integer,
            "REAL" => ColumnType::Real,
            "BOOLEAN" | "BOOL" => ColumnType::Boolean,
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "DATETIME" | "TIMESTAMP" => ColumnType::Datetime,
            "BLOB" => ColumnType::Blob,
            "FLOAT" => ColumnType::Float,
            "DOUBLE" => ColumnType::Double,
            "DECIMAL" | "NUMERIC" => ColumnType::Decimal,
            "VARCHAR" => ColumnType::Varchar,
            "CHAR" => ColumnType::Char,
            _ => ColumnType::Text,
        }
    }
}

/// Column-level constraint keywords.
///
/// `DEFAULT` followed by `CURRENT_TIMESTAMP` renders as
/// `DEFAULT CURRENT_TIMESTAMP`; a literal default goes in [`ColumnDef::default`]
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnConstraint {
    #[serde(rename = "PRIMARY KEY")]
    PrimaryKey,
    #[serde(rename = "UNIQUE")]
    Unique,
    #[serde(rename = "NOT NULL")]
    NotNull,
    #[serde(rename = "AUTOINCREMENT")]
    Autoincrement,
    #[serde(rename = "DEFAULT")]
    Default,
    #[serde(rename = "CURRENT_TIMESTAMP")]
    CurrentTimestamp,
}

impl ColumnConstraint {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnConstraint::PrimaryKey => "PRIMARY KEY",
            ColumnConstraint::Unique => "UNIQUE",
            ColumnConstraint::NotNull => "NOT NULL",
            ColumnConstraint::Autoincrement => "AUTOINCREMENT",
            ColumnConstraint::Default => "DEFAULT",
            ColumnConstraint::CurrentTimestamp => "CURRENT_TIMESTAMP",
        }
    }
}

/// A `REFERENCES table(column)` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// Definition of one column, as sent in a PUT and as read back from the
/// catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub constraints: Vec<ColumnConstraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ColumnDef {
    /// Creates a column with no constraints.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            constraints: Vec::new(),
            foreign_key: None,
            default: None,
        }
    }

    /// Builder-style constraint helper.
    pub fn with(mut self, constraint: ColumnConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn is_primary_key(&self) -> bool {
        self.constraints.contains(&ColumnConstraint::PrimaryKey)
    }
}

/// A table as the server caches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Name of the primary key column, if the table declares one.
    pub fn primary_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.is_primary_key())
            .map(|c| c.name.as_str())
    }
}

/// How an INSERT resolves a uniqueness conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConflictPolicy {
    Ignore,
    #[default]
    Replace,
    Rollback,
    Abort,
    Fail,
}

impl ConflictPolicy {
    /// The `OR ...` clause that follows `INSERT`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            ConflictPolicy::Ignore => "OR IGNORE",
            ConflictPolicy::Replace => "OR REPLACE",
            ConflictPolicy::Rollback => "OR ROLLBACK",
            ConflictPolicy::Abort => "OR ABORT",
            ConflictPolicy::Fail => "OR FAIL",
        }
    }
}

// =============================================================================
// Protocol Enums
// =============================================================================

/// The closed set of protocol methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    All,
}

impl Method {
    /// Parses a method name. Case is ignored.
    ///
    /// ```rust
    /// use qdb::types::Method;
    ///
    /// assert_eq!(Method::parse("get").unwrap(), Method::Get);
    /// assert!(Method::parse("FETCH").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "ALL" => Ok(Method::All),
            _ => Err(Error::UnsupportedMethod(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::All => "ALL",
        }
    }

    /// Methods whose success is broadcast to registered subscribers.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Patch | Method::Delete
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `type` field of an inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Query,
    Subscribe,
    Queue,
}

/// How a subscribe message is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeMode {
    /// Re-run the handler on a timer.
    Poll,
    /// Receive a push after each matching mutation.
    Register,
}

/// The `op` field of a queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOp {
    Enqueue,
    Dequeue,
    Ack,
    Fail,
}

/// A path that is routable on a mounted database without being a table.
///
/// GET on an alias answers `{}` so clients can probe it; everything else
/// treats it like an unknown table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAlias {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
}

impl RouteAlias {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: None,
        }
    }

    /// Whether this alias answers the given method.
    pub fn accepts(&self, method: Method) -> bool {
        match self.method {
            None | Some(Method::All) => true,
            Some(m) => m == method || (m == Method::Get && method == Method::All),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Lifecycle of a queue item.
///
/// ```text
/// Pending ──dequeue──► Processing ──ack──► Done
///                          │
///                          └──fail──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    /// The value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

    /// Parses a stored status. Anything else means the queue table was
    /// written outside this crate.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(Error::Schema(format!("unknown queue status '{other}'"))),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: JobId,
    pub topic: String,
    pub payload: Value,
    pub status: QueueStatus,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
}

// =============================================================================
// Time
// =============================================================================

/// Returns the current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
