//! # Expiration Log
//!
//! Rows written with a `ttl` get a line in an append-only JSONL file next to
//! the database:
//!
//! ```text
//! {"id":"42","table":"sessions","expiresAt":1767225600000}
//! ```
//!
//! A periodic sweep reads the file, deletes every row whose time has come
//! and rewrites the file with the lines that are still live. A line whose
//! delete fails stays in the file and is retried on the next sweep.
//!
//! Appends and sweeps share one async mutex, so a line appended during a
//! sweep is never lost to the rewrite.

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationEntry {
    /// Primary key value of the row, as text.
    pub id: String,
    pub table: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Due entries whose delete succeeded.
    pub removed: usize,
    /// Due entries whose delete failed; kept for retry.
    pub failed: usize,
    /// Entries not yet due.
    pub pending: usize,
}

/// Append-only JSONL log of row lifetimes.
#[derive(Debug)]
pub struct ExpirationLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ExpirationLog {
    /// Opens (creating if needed) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends entries, one line each.
    pub async fn append(&self, entries: &[ExpirationEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;

        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    /// Reads every well-formed entry.
    pub async fn entries(&self) -> Result<Vec<ExpirationEntry>> {
        let _guard = self.lock.lock().await;
        self.read_entries()
    }

    fn read_entries(&self) -> Result<Vec<ExpirationEntry>> {
        let text = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %self.path.display(), error = %e, "dropping unreadable expiration line"),
            }
        }
        Ok(entries)
    }

    /// Deletes everything due at `now_ms` through `delete`, then rewrites the
    /// file with what remains.
    pub async fn sweep<F, Fut>(&self, now_ms: i64, mut delete: F) -> Result<SweepReport>
    where
        F: FnMut(ExpirationEntry) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.lock.lock().await;
        let mut report = SweepReport::default();
        let mut keep = Vec::new();

        for entry in self.read_entries()? {
            if entry.expires_at > now_ms {
                report.pending += 1;
                keep.push(entry);
                continue;
            }
            match delete(entry.clone()).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(table = %entry.table, id = %entry.id, error = %e, "expired row delete failed");
                    report.failed += 1;
                    keep.push(entry);
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            self.rewrite(&keep)?;
        }
        debug!(
            path = %self.path.display(),
            removed = report.removed,
            failed = report.failed,
            pending = report.pending,
            "expiration sweep finished"
        );
        Ok(report)
    }

    fn rewrite(&self, entries: &[ExpirationEntry]) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn entry(id: &str, expires_at: i64) -> ExpirationEntry {
        ExpirationEntry {
            id: id.to_string(),
            table: "sessions".to_string(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_append_writes_jsonl() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let log = ExpirationLog::open(dir.path().join("logs/data.jsonl")).expect("should open");

        log.append(&[entry("1", 10), entry("2", 20)]).await.unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            text.lines().next(),
            Some(r#"{"id":"1","table":"sessions","expiresAt":10}"#)
        );
        assert_eq!(log.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_deletes_due_and_keeps_rest() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let log = ExpirationLog::open(dir.path().join("data.jsonl")).expect("should open");
        log.append(&[entry("1", 10), entry("2", 20), entry("3", 99)]).await.unwrap();

        let mut deleted = Vec::new();
        let report = log
            .sweep(50, |e| {
                deleted.push(e.id.clone());
                async move {
                    if e.id == "2" {
                        Err(Error::TableNotFound(e.table))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(deleted, vec!["1", "2"]);
        assert_eq!(report, SweepReport { removed: 1, failed: 1, pending: 1 });

        let left: Vec<String> = log.entries().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(left, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_unreadable_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("data.jsonl");
        fs::write(&path, "not json\n{\"id\":\"1\",\"table\":\"t\",\"expiresAt\":1}\n").unwrap();

        let log = ExpirationLog::open(&path).expect("should open");
        assert_eq!(log.entries().await.unwrap(), vec![ExpirationEntry {
            id: "1".to_string(),
            table: "t".to_string(),
            expires_at: 1,
        }]);
    }
}
