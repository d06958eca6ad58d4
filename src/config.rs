//! # Configuration
//!
//! Plain structs with `Default` impls built from the constants below. The
//! binary fills them from `QDB_*` environment variables via
//! [`ServerConfig::from_env`]; tests construct them directly.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `QDB_BIND_ADDR` | `bind_addr` | `0.0.0.0:3000` |
//! | `QDB_DATA_DIR` | `data_dir` | `db` |
//! | `QDB_POLL_INTERVAL_MS` | `default_poll_interval` | 1000 |
//! | `QDB_OUTBOUND_BUFFER` | `outbound_buffer` | 256 |
//! | `QDB_MAX_MESSAGE_BYTES` | `max_message_size` | 16 MiB |
//! | `QDB_SWEEP_INTERVAL_MS` | `database.sweep_interval` | 60000 |
//! | `QDB_STORAGE_CHANNEL_SIZE` | `database.storage.channel_size` | 1024 |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Default root directory; each database lives in `{data_dir}/{name}/`.
pub const DEFAULT_DATA_DIR: &str = "db";

/// Interval of a polling subscription that does not name one.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Largest inbound message accepted.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// How often expired rows are swept.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Capacity of the request channel into a storage thread.
pub const DEFAULT_STORAGE_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// Storage / Database
// =============================================================================

/// Configuration for one storage thread.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Requests that can queue up before callers wait.
    pub channel_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            channel_size: DEFAULT_STORAGE_CHANNEL_SIZE,
        }
    }
}

/// Configuration for one mounted database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub storage: StorageConfig,

    /// Period of the expiration sweep. Only file-backed databases sweep.
    pub sweep_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Configuration for the WebSocket server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to listen on. Port 0 picks a free port.
    pub bind_addr: String,

    pub data_dir: PathBuf,

    pub default_poll_interval: Duration,

    /// Per-connection outbound queue. Broadcasts to a full queue are dropped
    /// for that connection only.
    pub outbound_buffer: usize,

    /// Inbound frames above this size are rejected by the transport.
    pub max_message_size: usize,

    /// Applied to databases the binary mounts.
    pub database: DatabaseConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            default_poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_message_size: DEFAULT_MAX_MESSAGE_BYTES,
            database: DatabaseConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads `QDB_*` variables; unset ones keep their defaults.
    ///
    /// # Errors
    ///
    /// `Error::Config` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`] with an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("QDB_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup("QDB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "QDB_POLL_INTERVAL_MS")? {
            config.default_poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "QDB_OUTBOUND_BUFFER")? {
            config.outbound_buffer = n;
        }
        if let Some(n) = parse_var(&lookup, "QDB_MAX_MESSAGE_BYTES")? {
            config.max_message_size = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "QDB_SWEEP_INTERVAL_MS")? {
            config.database.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "QDB_STORAGE_CHANNEL_SIZE")? {
            config.database.storage.channel_size = n;
        }

        if config.outbound_buffer == 0 || config.database.storage.channel_size == 0 {
            return Err(Error::Config("channel sizes must be greater than zero".to_string()));
        }
        Ok(config)
    }

    /// Builder-style override of the listen address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}='{raw}' is not a valid number"))),
    }
}
