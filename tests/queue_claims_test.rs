//! Job Queue Claim Tests
//!
//! Tests for:
//! - Concurrent claims hand out each item exactly once
//! - Claims racing from separate SQLite connections
//! - Claim order (priority, then age, then id)
//! - ack/fail transitions

mod common;

use std::collections::HashSet;

use qdb::queue;
use qdb::{Error, Qdb, QueueStatus};
use serde_json::json;
use tokio::task::JoinSet;

/// N claimants racing for M < N items: M distinct claims, N - M empty.
#[tokio::test]
async fn concurrent_claims_are_exactly_once() {
    let dir = common::temp_data_dir();
    let db = Qdb::open("jobs", dir.path()).await.unwrap();

    const ITEMS: usize = 20;
    const CLAIMANTS: usize = 50;

    for i in 0..ITEMS {
        db.enqueue("work", json!({ "n": i }), 0).await.unwrap();
    }

    let mut tasks = JoinSet::new();
    for c in 0..CLAIMANTS {
        let db = db.clone();
        tasks.spawn(async move { db.dequeue(&format!("worker-{c}"), None).await.unwrap() });
    }

    let mut claimed = Vec::new();
    let mut empty = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Some(item) => claimed.push(item),
            None => empty += 1,
        }
    }

    let ids: HashSet<_> = claimed.iter().map(|item| item.id.clone()).collect();
    assert_eq!(claimed.len(), ITEMS);
    assert_eq!(ids.len(), ITEMS, "an item was claimed twice");
    assert_eq!(empty, CLAIMANTS - ITEMS);
    assert!(claimed.iter().all(|item| item.status == QueueStatus::Processing));

    db.shutdown().await;
}

/// Claims from independent connections (as separate processes would make)
/// never overlap either.
#[tokio::test]
async fn claims_across_connections_do_not_overlap() {
    let dir = common::temp_data_dir();
    let db = Qdb::open("jobs", dir.path()).await.unwrap();
    for i in 0..30 {
        db.enqueue("work", json!(i), 0).await.unwrap();
    }
    db.shutdown().await;

    let path = common::db_file(dir.path(), "jobs");
    let mut workers = Vec::new();
    for w in 0..4 {
        let path = path.clone();
        workers.push(std::thread::spawn(move || {
            let conn = common::open_read_write(&path);
            let mut mine = Vec::new();
            loop {
                let claimed = match queue::dequeue(&conn, &format!("w{w}"), None) {
                    Err(Error::Sqlite(e))
                        if e.sqlite_error_code() == Some(rusqlite::ErrorCode::DatabaseBusy) =>
                    {
                        continue
                    }
                    other => other.unwrap(),
                };
                match claimed {
                    Some(item) => mine.push(item.id.as_str().to_string()),
                    None => break,
                }
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.join().unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
}

#[tokio::test]
async fn claims_follow_priority_then_age() {
    let dir = common::temp_data_dir();
    let path = common::db_file(dir.path(), "jobs");
    let db = Qdb::open("jobs", dir.path()).await.unwrap();
    db.shutdown().await;

    let conn = common::open_read_write(&path);
    let old_low = queue::enqueue_at(&conn, "t", &json!("old-low"), 0, 1_000).unwrap();
    let new_high = queue::enqueue_at(&conn, "t", &json!("new-high"), 5, 3_000).unwrap();
    let old_high = queue::enqueue_at(&conn, "t", &json!("old-high"), 5, 2_000).unwrap();

    let order: Vec<String> = std::iter::from_fn(|| queue::dequeue(&conn, "w", None).unwrap())
        .map(|item| item.id.as_str().to_string())
        .collect();

    assert_eq!(
        order,
        vec![old_high.as_str(), new_high.as_str(), old_low.as_str()]
    );
}

#[tokio::test]
async fn ack_and_fail_transitions() {
    let db = Qdb::open_in_memory("jobs").await.unwrap();
    let first = db.enqueue("mail", json!({"to": "a"}), 0).await.unwrap();
    let second = db.enqueue("mail", json!({"to": "b"}), 0).await.unwrap();

    // Not claimed yet.
    let early = db.ack(first.as_str()).await.unwrap_err();
    assert!(matches!(
        early,
        Error::InvalidTransition { from: QueueStatus::Pending, to: QueueStatus::Done, .. }
    ));

    db.dequeue("w", None).await.unwrap().unwrap();
    db.dequeue("w", None).await.unwrap().unwrap();

    let done = db.ack(first.as_str()).await.unwrap();
    assert_eq!(done.status, QueueStatus::Done);

    let failed = db.fail(second.as_str(), "smtp down").await.unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("smtp down"));

    // Acking again is reported, and the other row is untouched.
    assert!(matches!(
        db.ack(first.as_str()).await,
        Err(Error::InvalidTransition { from: QueueStatus::Done, .. })
    ));
    assert_eq!(db.job(second.as_str()).await.unwrap().unwrap().status, QueueStatus::Failed);

    assert!(matches!(db.ack("missing").await, Err(Error::QueueItemNotFound(_))));
}

#[tokio::test]
async fn dequeue_by_topic() {
    let db = Qdb::open_in_memory("jobs").await.unwrap();
    db.enqueue("mail", json!(1), 9).await.unwrap();
    let report = db.enqueue("reports", json!(2), 0).await.unwrap();

    let item = db.dequeue("w", Some("reports")).await.unwrap().unwrap();
    assert_eq!(item.id, report);
    assert!(db.dequeue("w", Some("reports")).await.unwrap().is_none());

    let mail = db.dequeue("w", None).await.unwrap().unwrap();
    assert_eq!(mail.topic, "mail");
}
