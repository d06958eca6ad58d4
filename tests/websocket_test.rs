//! End-to-end WebSocket Tests
//!
//! Tests for:
//! - The shop scenario over a real socket
//! - Broadcast prefix matching between connections
//! - Malformed frames keep the connection usable
//! - Handshake path as default route
//! - Polling subscriptions
//! - Tenant isolation

mod common;

use std::time::Duration;

use qdb::Qdb;
use serde_json::json;

#[tokio::test]
async fn shop_scenario() {
    let server = common::start_server(vec![Qdb::open_in_memory("shop").await.unwrap()]).await;
    let mut writer = common::connect(&server, "/").await;
    let mut shop_watcher = common::connect(&server, "/").await;
    let mut users_watcher = common::connect(&server, "/").await;

    let ack = common::request(&mut shop_watcher, json!({"type": "subscribe", "route": "shop"})).await;
    assert_eq!(ack["success"], true);
    let ack = common::request(&mut users_watcher, json!({"type": "subscribe", "route": "shop/users"})).await;
    assert_eq!(ack["success"], true);

    let created = common::request(
        &mut writer,
        json!({
            "method": "PUT",
            "route": "shop/orders",
            "columns": [
                {"name": "id", "type": "INTEGER", "constraints": ["PRIMARY KEY"]},
                {"name": "total", "type": "REAL"}
            ]
        }),
    )
    .await;
    assert_eq!(created["success"], true);
    assert!(server.router().registry().resolve("shop").unwrap().database.has_table("orders").await);

    // PUT is a mutation too.
    let update = common::recv(&mut shop_watcher).await;
    assert_eq!(update["method"], "PUT");

    let inserted = common::request(
        &mut writer,
        json!({"method": "POST", "route": "shop/orders", "data": [{"id": 1, "total": 9.5}]}),
    )
    .await;
    assert_eq!(inserted, json!({"success": true, "data": [{"id": 1, "total": 9.5}]}));

    let update = common::recv(&mut shop_watcher).await;
    assert_eq!(
        update,
        json!({"type": "update", "method": "POST", "route": "shop/orders", "data": [{"id": 1, "total": 9.5}]})
    );
    common::assert_silent(&mut users_watcher, Duration::from_millis(200)).await;

    let one = common::request(&mut writer, json!({"method": "GET", "route": "shop/orders/1"})).await;
    assert_eq!(one, json!({"success": true, "data": [{"id": 1, "total": 9.5}]}));

    let deleted = common::request(&mut writer, json!({"method": "DELETE", "route": "shop/orders/1"})).await;
    assert_eq!(deleted["success"], true);

    let gone = common::request(&mut writer, json!({"method": "GET", "route": "shop/orders/1"})).await;
    assert_eq!(gone, json!({"success": false, "data": {}, "error": "Table 'orders' is empty"}));

    server.shutdown().await;
}

#[tokio::test]
async fn filtered_get_with_other_rows_left() {
    let server = common::start_server(vec![Qdb::open_in_memory("shop").await.unwrap()]).await;
    let mut client = common::connect(&server, "/").await;

    common::request(
        &mut client,
        json!({
            "method": "PUT",
            "route": "shop/orders",
            "columns": [{"name": "id", "type": "INTEGER", "constraints": ["PRIMARY KEY"]}],
            "data": [{"id": 1}, {"id": 2}]
        }),
    )
    .await;
    common::request(&mut client, json!({"method": "DELETE", "route": "shop/orders/1"})).await;

    let filtered = common::request(&mut client, json!({"method": "GET", "route": "shop/orders/1"})).await;
    assert_eq!(filtered, json!({"success": true, "data": []}));

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_keeps_connection_usable() {
    let server = common::start_server(vec![Qdb::open_in_memory("shop").await.unwrap()]).await;
    let mut client = common::connect(&server, "/").await;

    common::send_text(&mut client, "this is not json").await;
    assert_eq!(common::recv(&mut client).await, json!({"error": "Invalid Query format"}));

    let ok = common::request(&mut client, json!({"method": "GET", "route": "shop"})).await;
    assert_eq!(ok, json!({"success": true, "data": {}}));

    let unsupported = common::request(&mut client, json!({"method": "FETCH", "route": "shop"})).await;
    assert_eq!(unsupported["success"], false);

    let still_ok = common::request(&mut client, json!({"method": "GET", "route": "shop"})).await;
    assert_eq!(still_ok["success"], true);

    server.shutdown().await;
}

#[tokio::test]
async fn handshake_path_is_default_route() {
    let server = common::start_server(vec![Qdb::open_in_memory("shop").await.unwrap()]).await;
    let mut client = common::connect(&server, "/shop/tags").await;

    let created = common::request(
        &mut client,
        json!({"method": "PUT", "columns": [{"name": "name", "type": "TEXT", "constraints": ["PRIMARY KEY"]}]}),
    )
    .await;
    assert_eq!(created["data"]["table"]["name"], "tags");

    let inserted = common::request(&mut client, json!({"method": "POST", "data": [{"name": "red"}]})).await;
    assert_eq!(inserted["data"], json!([{"name": "red"}]));

    // An explicit route still wins.
    let other = common::request(&mut client, json!({"method": "GET", "route": "shop"})).await;
    assert_eq!(other["data"], json!({}));

    server.shutdown().await;
}

#[tokio::test]
async fn poll_subscription_pushes_until_timeout() {
    let server = common::start_server(vec![Qdb::open_in_memory("shop").await.unwrap()]).await;
    let mut client = common::connect(&server, "/").await;

    common::request(
        &mut client,
        json!({
            "method": "PUT",
            "route": "shop/orders",
            "columns": [{"name": "id", "type": "INTEGER", "constraints": ["PRIMARY KEY"]}],
            "data": [{"id": 7}]
        }),
    )
    .await;

    let ack = common::request(
        &mut client,
        json!({"type": "subscribe", "method": "GET", "route": "shop/orders", "interval": 50, "timeout": 500}),
    )
    .await;
    assert_eq!(ack["data"]["mode"], "poll");

    for _ in 0..3 {
        let tick = common::recv(&mut client).await;
        assert_eq!(tick, json!({"success": true, "data": [{"id": 7}]}));
    }

    // Drain whatever is left, then nothing more arrives.
    tokio::time::sleep(Duration::from_millis(600)).await;
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(50), futures::StreamExt::next(&mut client)).await {}
    common::assert_silent(&mut client, Duration::from_millis(300)).await;

    server.shutdown().await;
}

#[tokio::test]
async fn tenants_are_isolated() {
    let dir = common::temp_data_dir();
    let shop = Qdb::open("shop", dir.path()).await.unwrap();
    let blog = Qdb::open("blog", dir.path()).await.unwrap();
    let server = common::start_server(vec![shop, blog]).await;
    let mut client = common::connect(&server, "/").await;

    for (db, id) in [("shop", 1), ("blog", 2)] {
        let created = common::request(
            &mut client,
            json!({
                "method": "PUT",
                "route": format!("{db}/items"),
                "columns": [{"name": "id", "type": "INTEGER", "constraints": ["PRIMARY KEY"]}],
                "data": [{"id": id}]
            }),
        )
        .await;
        assert_eq!(created["success"], true);
    }

    let shop_items = common::request(&mut client, json!({"method": "GET", "route": "shop/items"})).await;
    assert_eq!(shop_items["data"], json!([{"id": 1}]));
    let blog_items = common::request(&mut client, json!({"method": "GET", "route": "blog/items"})).await;
    assert_eq!(blog_items["data"], json!([{"id": 2}]));

    let dropped = common::request(&mut client, json!({"method": "DELETE", "route": "blog"})).await;
    assert_eq!(dropped["data"], json!({"dropped": ["items"]}));
    let shop_items = common::request(&mut client, json!({"method": "GET", "route": "shop/items"})).await;
    assert_eq!(shop_items["data"], json!([{"id": 1}]));

    let missing = common::request(&mut client, json!({"method": "GET", "route": "news"})).await;
    assert_eq!(missing["error"], "Database 'news' not found");

    server.shutdown().await;
    assert!(common::db_file(dir.path(), "shop").exists());
}

#[tokio::test]
async fn queue_over_socket() {
    let server = common::start_server(vec![Qdb::open_in_memory("shop").await.unwrap()]).await;
    let mut producer = common::connect(&server, "/shop").await;
    let mut consumer = common::connect(&server, "/shop").await;

    let queued = common::request(
        &mut producer,
        json!({"type": "queue", "op": "enqueue", "topic": "mail", "payload": {"to": "x@y"}}),
    )
    .await;
    let id = queued["data"]["id"].clone();

    let claimed = common::request(&mut consumer, json!({"type": "queue", "op": "dequeue", "claimant": "c1"})).await;
    assert_eq!(claimed["data"]["id"], id);
    assert_eq!(claimed["data"]["payload"], json!({"to": "x@y"}));
    assert_eq!(claimed["data"]["claimedBy"], "c1");

    let acked = common::request(&mut consumer, json!({"type": "queue", "op": "ack", "id": id})).await;
    assert_eq!(acked["data"]["status"], "done");

    server.shutdown().await;
}

#[tokio::test]
async fn tenant_delete_with_foreign_keys() {
    let server = common::start_server(vec![Qdb::open_in_memory("shop").await.unwrap()]).await;
    let mut client = common::connect(&server, "/shop").await;

    let orders = common::request(
        &mut client,
        json!({
            "method": "PUT",
            "route": "shop/orders",
            "columns": [{"name": "id", "type": "INTEGER", "constraints": ["PRIMARY KEY"]}],
            "data": [{"id": 1}]
        }),
    )
    .await;
    assert_eq!(orders["success"], true);

    let lines = common::request(
        &mut client,
        json!({
            "method": "PUT",
            "route": "shop/lines",
            "columns": [
                {"name": "id", "type": "INTEGER", "constraints": ["PRIMARY KEY"]},
                {"name": "order_id", "type": "INTEGER", "foreignKey": {"table": "orders", "column": "id"}}
            ],
            "data": [{"id": 1, "order_id": 1}]
        }),
    )
    .await;
    assert_eq!(lines["success"], true);

    let dropped = common::request(&mut client, json!({"method": "DELETE", "route": "shop"})).await;
    assert_eq!(dropped, json!({"success": true, "data": {"dropped": ["lines", "orders"]}}));

    server.shutdown().await;
}
