//! Persistence and Expiration Tests
//!
//! Tests for:
//! - Tables and rows survive a restart, and the cache is rebuilt from disk
//! - Create-with-seed is all-or-nothing
//! - TTL rows are swept, also across a restart

mod common;

use std::time::Duration;

use qdb::{ColumnConstraint, ColumnDef, ColumnType, ConflictPolicy, Error, Qdb, TableDescriptor};
use serde_json::{json, Map, Value};

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn sessions() -> TableDescriptor {
    TableDescriptor::new(
        "sessions",
        vec![
            ColumnDef::new("token", ColumnType::Text).with(ColumnConstraint::PrimaryKey),
            ColumnDef::new("user", ColumnType::Text).with(ColumnConstraint::NotNull),
        ],
    )
}

#[tokio::test]
async fn tables_survive_restart() {
    let dir = common::temp_data_dir();

    let db = Qdb::open("app", dir.path()).await.unwrap();
    db.create_table(sessions(), vec![row(json!({"token": "a", "user": "ann"}))], ConflictPolicy::Abort)
        .await
        .unwrap();
    db.shutdown().await;

    let reopened = Qdb::open("app", dir.path()).await.unwrap();
    let cached = reopened.table("sessions").await.expect("table should be cached after reopen");
    assert_eq!(cached.primary_key(), Some("token"));

    let data = reopened.get_table_data("sessions").await.unwrap();
    assert_eq!(data.primary_key.as_deref(), Some("token"));
    assert_eq!(data.rows, vec![row(json!({"token": "a", "user": "ann"}))]);

    reopened.shutdown().await;
}

#[tokio::test]
async fn failed_seed_rolls_back_create() {
    let db = Qdb::open_in_memory("app").await.unwrap();

    // Second seed row violates NOT NULL, so the whole create is undone.
    let err = db
        .create_table(
            sessions(),
            vec![row(json!({"token": "a", "user": "ann"})), row(json!({"token": "b"}))],
            ConflictPolicy::Abort,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)));
    assert!(!db.has_table("sessions").await);

    db.create_table(sessions(), vec![], ConflictPolicy::Abort).await.unwrap();
    assert!(db.get_table_data("sessions").await.unwrap().rows.is_empty());
}

#[tokio::test]
async fn expired_rows_are_swept() {
    let dir = common::temp_data_dir();
    let db = Qdb::open("app", dir.path()).await.unwrap();
    db.create_table(sessions(), vec![], ConflictPolicy::Abort).await.unwrap();

    let short = db
        .insert_data("sessions", vec![row(json!({"token": "short", "user": "a"}))], ConflictPolicy::Abort)
        .await
        .unwrap();
    let long = db
        .insert_data("sessions", vec![row(json!({"token": "long", "user": "b"}))], ConflictPolicy::Abort)
        .await
        .unwrap();

    assert_eq!(db.expire_rows("sessions", &short, Duration::ZERO).await.unwrap(), 1);
    assert_eq!(db.expire_rows("sessions", &long, Duration::from_secs(3600)).await.unwrap(), 1);

    let report = db.sweep_expired().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.pending, 1);

    let tokens: Vec<Value> = db
        .get_table_data("sessions")
        .await
        .unwrap()
        .rows
        .into_iter()
        .map(|r| r["token"].clone())
        .collect();
    assert_eq!(tokens, vec![json!("long")]);

    db.shutdown().await;

    // The pending entry is still on disk after a restart.
    let log = dir.path().join("app").join("logs").join("data.jsonl");
    let text = std::fs::read_to_string(log).unwrap();
    assert_eq!(text.lines().count(), 1);
    assert!(text.contains("\"id\":\"long\""));
}

#[tokio::test]
async fn sweep_tolerates_dropped_tables() {
    let dir = common::temp_data_dir();
    let db = Qdb::open("app", dir.path()).await.unwrap();
    db.create_table(sessions(), vec![], ConflictPolicy::Abort).await.unwrap();
    let rows = db
        .insert_data("sessions", vec![row(json!({"token": "t", "user": "u"}))], ConflictPolicy::Abort)
        .await
        .unwrap();
    db.expire_rows("sessions", &rows, Duration::ZERO).await.unwrap();

    db.delete_table("sessions").await.unwrap();

    let report = db.sweep_expired().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.failed, 0);

    db.shutdown().await;
}
