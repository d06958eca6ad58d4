#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use qdb::{Qdb, QdbServer, ServerConfig, ServerHandle};
use rusqlite::Connection;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A fresh data directory.
pub fn temp_data_dir() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("create temp dir")
}

/// Path of the SQLite file `Qdb::open` uses for `name` under `dir`.
pub fn db_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(name).join(format!("{name}.db"))
}

pub fn open_read_write(path: &Path) -> Connection {
    let conn = Connection::open(path).expect("open read-write connection");
    conn.busy_timeout(Duration::from_secs(10)).expect("set busy timeout");
    conn
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Starts a server on an ephemeral port with the given databases mounted.
pub async fn start_server(databases: Vec<Qdb>) -> ServerHandle {
    let server = QdbServer::new(ServerConfig::default().with_bind_addr("127.0.0.1:0"));
    for db in databases {
        server.mount_db(db, None, Vec::new()).expect("mount database");
    }
    server.listen().await.expect("listen")
}

/// Connects a client to `path` on the server.
pub async fn connect(handle: &ServerHandle, path: &str) -> Client {
    let url = format!("ws://{}/{}", handle.local_addr(), path.trim_start_matches('/'));
    let (client, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    client
}

pub async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::text(text.to_string()))
        .await
        .expect("send frame");
}

pub async fn send(client: &mut Client, frame: Value) {
    send_text(client, &frame.to_string()).await;
}

/// Next text frame as JSON.
pub async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("read frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("frame should be json");
        }
    }
}

/// Sends a request and returns the next frame.
pub async fn request(client: &mut Client, frame: Value) -> Value {
    send(client, frame).await;
    recv(client).await
}

/// Asserts that no frame arrives within `wait`.
pub async fn assert_silent(client: &mut Client, wait: Duration) {
    if let Ok(Some(Ok(frame))) = tokio::time::timeout(wait, client.next()).await {
        panic!("unexpected frame: {frame:?}");
    }
}
