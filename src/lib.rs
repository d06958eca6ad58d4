//! # QDB - Realtime Data Server
//!
//! QDB serves SQLite databases to WebSocket clients. It provides:
//!
//! - **Multi-tenancy**: many databases mounted under one server, one path each
//! - **Route-addressed CRUD**: `{database}/{table}/{key}` plus a method
//! - **Live updates**: polling subscriptions and change broadcasts
//! - **Job queue**: per-database queue with atomic claims
//! - **Row expiration**: per-row TTLs swept in the background
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     WebSocket Server                            │
//! │          (reader loop + writer task per connection)             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ text frames
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Router                                 │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │ Interceptors│  │   Tenant    │  │  Subscriptions          │ │
//! │  │             │  │  Registry   │  │  (register + poll)      │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Qdb (one per database)                        │
//! │        table cache · queue · expiration log + sweep             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ closures over a channel
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               Storage thread (owns the Connection)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Parameterized SQL**: values are always bound, identifiers are
//!    validated and quoted
//! 2. **One writer per database**: every statement runs on that database's
//!    storage thread, in arrival order
//! 3. **Exactly-once claims**: a queue item moves to `processing` for at most
//!    one claimant
//! 4. **Errors are replies**: nothing a client sends closes its connection
//!
//! ## Module Organization
//!
//! - [`error`]: Error type and its wire form
//! - [`types`]: Domain types (columns, tables, methods, queue items)
//! - [`route`]: Route parsing and prefix matching
//! - [`schema`]: Internal DDL and database initialization
//! - [`query`]: SQL building and execution
//! - [`storage`]: Storage thread and its async handle
//! - [`queue`]: Job queue statements
//! - [`expiration`]: Row expiration log
//! - [`api`]: Async per-database API (main entry point for embedding)
//! - [`registry`]: Mount paths to databases
//! - [`subscription`]: Registered routes and change broadcast
//! - [`protocol`]: Wire messages
//! - [`router`]: Message dispatch and polling
//! - [`server`]: WebSocket transport
//! - [`config`]: Server and storage configuration

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for QDB operations.
///
/// Error messages double as the text clients receive in `error`.
pub mod error;

/// Domain types: identifiers, column and table descriptors, protocol enums
/// and queue items.
pub mod types;

/// Route parsing.
pub mod route;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// SQL generation and execution against a connection.
pub mod query;

/// The storage thread.
///
/// Each database has one OS thread owning its `rusqlite::Connection`. Async
/// callers send closures to it and await the result on a oneshot channel.
pub mod storage;

/// Job queue operations.
pub mod queue;

/// Row expiration log.
pub mod expiration;

/// Async API for one database.
///
/// The main entry point is [`Qdb`](api::Qdb).
pub mod api;

/// Tenant registry.
pub mod registry;

/// Registered subscriptions and change broadcast.
pub mod subscription;

/// Wire messages.
pub mod protocol;

/// Message dispatch.
pub mod router;

/// WebSocket server.
pub mod server;

/// Configuration.
pub mod config;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::Qdb;
pub use config::{DatabaseConfig, ServerConfig, StorageConfig};
pub use error::{Error, Result};
pub use registry::{MountedDatabase, TenantRegistry};
pub use route::Route;
pub use router::{Interceptor, Router, Session};
pub use schema::{CoreSchema, Database, SchemaBootstrap};
pub use server::{QdbServer, ServerHandle};
pub use storage::{spawn_storage_engine, StorageHandle};

pub use types::{
    ColumnConstraint, ColumnDef, ColumnType, ConflictPolicy, ForeignKey, JobId, Method,
    QueueItem, QueueStatus, Row, RouteAlias, TableDescriptor,
};

pub use protocol::{Request, Response};
pub use subscription::{ChangeNotification, Subscription, SubscriptionManager};
