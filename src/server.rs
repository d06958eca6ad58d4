//! WebSocket transport.
//!
//! [`QdbServer`] binds a TCP listener and runs one task per accepted
//! connection. Each connection is split in two:
//!
//! - the reader loop awaits one frame at a time and hands it to the
//!   [`Router`], so a connection's messages are handled in arrival order;
//! - a writer task drains the session's outbound channel into the socket.
//!   Replies, poll results and broadcasts all go through it.
//!
//! The request path of the WebSocket handshake (`ws://host/shop/orders`)
//! becomes the connection's default route.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::api::Qdb;
use crate::config::ServerConfig;
use crate::registry::MountedDatabase;
use crate::router::{Interceptor, Router};
use crate::types::RouteAlias;
use crate::Result;

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long shutdown waits for open connections to wind down.
const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A server that has not started listening yet.
pub struct QdbServer {
    config: ServerConfig,
    router: Arc<Router>,
}

impl QdbServer {
    pub fn new(config: ServerConfig) -> Self {
        let router = Arc::new(Router::new(&config));
        Self { config, router }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Mounts a database under `alias` or its own name.
    pub fn mount_db(
        &self,
        database: Qdb,
        alias: Option<&str>,
        route_aliases: Vec<RouteAlias>,
    ) -> Result<Arc<MountedDatabase>> {
        self.router.mount(database, alias, route_aliases)
    }

    pub fn intercept(&self, interceptor: Interceptor) {
        self.router.intercept(interceptor);
    }

    /// Binds the configured address and starts accepting connections.
    pub async fn listen(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_message_size));

        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.router),
            ws_config,
            shutdown_rx,
        ));

        info!(addr = %local_addr, databases = ?self.router.registry().paths(), "qdb listening");
        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            acceptor,
            router: self.router,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    router: Arc<Router>,
}

impl ServerHandle {
    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Stops accepting, closes every connection and shuts down every mounted
    /// database.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.acceptor.await {
            warn!(error = %e, "acceptor task failed");
        }
        self.router.registry().shutdown_all().await;
        info!(addr = %self.local_addr, "qdb stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    ws_config: WebSocketConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(addr = %addr, "accepted tcp connection");
                    connections.spawn(serve_connection(
                        Arc::clone(&router),
                        stream,
                        addr,
                        ws_config,
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept error"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("acceptor shutting down");
                break;
            }
        }
    }

    let drained = tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "connections did not close in time, aborting");
        connections.abort_all();
    }
}

async fn serve_connection(
    router: Arc<Router>,
    stream: TcpStream,
    addr: SocketAddr,
    ws_config: WebSocketConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut handshake_path = None;
    let capture_path = |req: &HandshakeRequest, resp: HandshakeResponse| -> std::result::Result<HandshakeResponse, ErrorResponse> {
        handshake_path = Some(req.uri().path().to_string());
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, capture_path, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(addr = %addr, error = %e, "websocket handshake failed");
            return;
        }
    };
    let default_route = handshake_path.filter(|p| !p.trim_matches('/').is_empty());

    let (mut sink, mut frames) = ws.split();
    let (mut session, mut outbound) = router.connect(default_route);
    debug!(addr = %addr, connection = %session.id(), "websocket established");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sink.send(Message::text(frame)).await {
                debug!(error = %e, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => router.handle_text(&mut session, text.as_str()).await,
                Some(Ok(Message::Binary(data))) => {
                    // Non-UTF-8 payloads get the same answer as bad JSON.
                    let text = std::str::from_utf8(&data).unwrap_or_default();
                    router.handle_text(&mut session, text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // Ping/Pong handled by tungstenite
                Some(Err(e)) => {
                    debug!(addr = %addr, error = %e, "websocket read error");
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    router.disconnect(&mut session);
    drop(session);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(addr = %addr, "writer did not drain in time");
        writer.abort();
    }
}
