//! # Protocol Router
//!
//! Turns one inbound frame into one outbound frame. The router owns the
//! [`TenantRegistry`], the [`SubscriptionManager`] and the interceptor list;
//! the socket layer owns nothing but the transport and a [`Session`] per
//! connection.
//!
//! ## Dispatch
//!
//! ```text
//! frame ──parse──► Request ──route──► interceptors ──► queue op
//!                                          │
//!                                          └──► method ──► tenant ──► handler
//!                                                                       │
//!                               mutating + success ──► broadcast ◄──────┘
//! ```
//!
//! Every failure after parsing becomes a `{success:false}` envelope on the
//! same connection. Nothing a client sends closes its connection.
//!
//! ## Polling
//!
//! A poll subscription is a task in the session's `JoinSet`. It re-runs the
//! same request every interval and sends each result through the session's
//! outbound channel. Dropping or disconnecting the session aborts it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{expiry_deadline, Qdb};
use crate::config::ServerConfig;
use crate::protocol::{parse_failure, Request, Response};
use crate::registry::{MountedDatabase, TenantRegistry};
use crate::route::Route;
use crate::subscription::{ChangeNotification, SubscriptionManager};
use crate::types::{
    ConnectionId, MessageType, Method, QueueOp, Row, RouteAlias, SubscribeMode, TableDescriptor,
};
use crate::{Error, Result};

/// Boxed future returned by an interceptor handler.
pub type InterceptorFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send>>;

type InterceptorFn = dyn Fn(Request) -> InterceptorFuture + Send + Sync;

/// A hook that sees requests for one mount path before any handler does.
///
/// Only the first interceptor registered for a path runs. A non-passthrough interceptor that returns a value answers the request
/// with that value, sent as is. `None`, `null` and `false` let the request
/// continue. Passthrough interceptors only observe.
pub struct Interceptor {
    match_path: String,
    passthrough: bool,
    handler: Box<InterceptorFn>,
}

impl Interceptor {
    pub fn new<F, Fut>(match_path: impl Into<String>, passthrough: bool, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        Self {
            match_path: match_path.into(),
            passthrough,
            handler: Box::new(move |req| Box::pin(handler(req))),
        }
    }

    pub fn match_path(&self) -> &str {
        &self.match_path
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Per-connection state held by the socket task.
pub struct Session {
    id: ConnectionId,
    state: ConnectionState,
    /// Handshake path, used when a message carries no route.
    default_route: Option<String>,
    outbound: mpsc::Sender<String>,
    polls: JoinSet<()>,
    subscriptions: Arc<SubscriptionManager>,
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn default_route(&self) -> Option<&str> {
        self.default_route.as_deref()
    }

    /// Poll subscriptions still running.
    pub fn active_polls(&mut self) -> usize {
        self.reap_polls();
        self.polls.len()
    }

    fn reap_polls(&mut self) {
        while self.polls.try_join_next().is_some() {}
    }

    async fn send(&self, text: String) -> bool {
        self.outbound.send(text).await.is_ok()
    }
}

/// A session dropped without [`Router::disconnect`] (for example when its
/// socket task unwinds) still releases its registrations. Dropping the
/// `JoinSet` aborts its polls.
impl Drop for Session {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            self.subscriptions.remove_client(self.id);
            debug!(connection = %self.id, "session dropped without disconnect");
        }
    }
}

/// Dispatches client messages for every connection of a server.
pub struct Router {
    registry: Arc<TenantRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    interceptors: RwLock<Vec<Arc<Interceptor>>>,
    next_connection: AtomicU64,
    default_poll_interval: Duration,
    outbound_buffer: usize,
}

impl Router {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: Arc::new(TenantRegistry::new()),
            subscriptions: Arc::new(SubscriptionManager::new()),
            interceptors: RwLock::new(Vec::new()),
            next_connection: AtomicU64::new(1),
            default_poll_interval: config.default_poll_interval,
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Mounts `database` under `alias` or its own name.
    pub fn mount(
        &self,
        database: Qdb,
        alias: Option<&str>,
        route_aliases: Vec<RouteAlias>,
    ) -> Result<Arc<MountedDatabase>> {
        self.registry.mount(database, alias, route_aliases)
    }

    /// Adds an interceptor after the existing ones. An earlier interceptor
    /// on the same path shadows it.
    pub fn intercept(&self, interceptor: Interceptor) {
        debug!(path = %interceptor.match_path, passthrough = interceptor.passthrough, "interceptor registered");
        self.interceptors.write().push(Arc::new(interceptor));
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Opens a session. The receiver yields every frame destined for the
    /// client, in order.
    pub fn connect(&self, default_route: Option<String>) -> (Session, mpsc::Receiver<String>) {
        let id = ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.outbound_buffer);

        let mut session = Session {
            id,
            state: ConnectionState::Connecting,
            default_route,
            outbound: tx.clone(),
            polls: JoinSet::new(),
            subscriptions: Arc::clone(&self.subscriptions),
        };
        self.subscriptions.add_client(id, tx);
        session.state = ConnectionState::Open;

        info!(connection = %id, route = session.default_route.as_deref().unwrap_or(""), "connection opened");
        (session, rx)
    }

    /// Closes a session: aborts its polls and forgets its registrations.
    pub fn disconnect(&self, session: &mut Session) {
        if session.state == ConnectionState::Closed {
            return;
        }
        session.state = ConnectionState::Closed;
        session.polls.abort_all();
        let dropped = self.subscriptions.remove_client(session.id).unwrap_or(0);
        info!(connection = %session.id, subscriptions = dropped, "connection closed");
    }

    /// Handles one text frame, queueing the reply on the session's channel.
    pub async fn handle_text(self: &Arc<Self>, session: &mut Session, text: &str) {
        if session.state != ConnectionState::Open {
            debug!(connection = %session.id, "frame on a closed session ignored");
            return;
        }

        let reply = match Request::parse(text) {
            Ok(request) => self.dispatch(session, request).await,
            Err(e) => {
                debug!(connection = %session.id, error = %e, "unparseable frame");
                parse_failure()
            }
        };

        if !session.send(reply).await {
            debug!(connection = %session.id, "outbound channel closed, reply dropped");
        }
    }

    /// Runs one request and returns the reply frame.
    pub async fn dispatch(self: &Arc<Self>, session: &mut Session, request: Request) -> String {
        session.reap_polls();

        let raw_route = request
            .route
            .as_deref()
            .or(session.default_route.as_deref())
            .unwrap_or_default();
        let route = match Route::parse(raw_route) {
            Ok(route) => route,
            Err(e) => return Response::from_error(&e).to_json(),
        };

        if let Some(value) = self.run_interceptors(&route, &request).await {
            return value.to_string();
        }

        if request.kind == MessageType::Queue {
            let result = self.handle_queue(session.id, &route, &request).await;
            if let Err(e) = &result {
                log_failure(e, &route, "QUEUE");
            }
            return Response::from(result).to_json();
        }

        // Registering a route needs no method; polls default to reading it.
        let default_method = match request.kind {
            MessageType::Subscribe => Method::Get.as_str(),
            _ => "",
        };
        let method = match Method::parse(request.method.as_deref().unwrap_or(default_method)) {
            Ok(method) => method,
            Err(e) => return Response::from_error(&e).to_json(),
        };

        match request.kind {
            MessageType::Subscribe => self.subscribe(session, route, method, request),
            _ => self.run_query(&route, method, &request).await.to_json(),
        }
    }

    /// Runs the first interceptor mounted on the route's database.
    ///
    /// A passthrough interceptor never answers. Any other answers with its
    /// value unless that value is absent, `null` or `false`.
    async fn run_interceptors(&self, route: &Route, request: &Request) -> Option<Value> {
        let interceptor = self
            .interceptors
            .read()
            .iter()
            .find(|i| i.match_path == route.database())
            .cloned()?;

        let value = (interceptor.handler)(request.clone()).await;
        if interceptor.passthrough {
            return None;
        }
        match value {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(value) => {
                debug!(path = %interceptor.match_path, route = %route, "request answered by interceptor");
                Some(value)
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Runs a query and broadcasts successful mutations.
    pub async fn run_query(&self, route: &Route, method: Method, request: &Request) -> Response {
        match self.execute(route, method, request).await {
            Ok(data) => {
                if method.is_mutating() {
                    let notification = ChangeNotification::new(method, route.clone(), data.clone());
                    let result = self.subscriptions.broadcast(&notification);
                    if result.sent + result.dropped > 0 {
                        debug!(route = %route, method = %method, sent = result.sent, dropped = result.dropped, "change broadcast");
                    }
                }
                Response::ok(data)
            }
            Err(e) => {
                log_failure(&e, route, method.as_str());
                Response::from_error(&e)
            }
        }
    }

    async fn execute(&self, route: &Route, method: Method, request: &Request) -> Result<Value> {
        let mount = self.registry.resolve(route.database())?;
        match method {
            Method::Get | Method::All => read(&mount, route, method).await,
            Method::Post => insert(&mount, route, request).await,
            Method::Put => create(&mount, route, request).await,
            Method::Patch => update(&mount, route, request).await,
            Method::Delete => remove(&mount, route).await,
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    fn subscribe(self: &Arc<Self>, session: &mut Session, route: Route, method: Method, request: Request) -> String {
        if let Err(e) = self.registry.resolve(route.database()) {
            return Response::from_error(&e).to_json();
        }

        match request.subscribe_mode() {
            SubscribeMode::Register => match self.subscriptions.subscribe(session.id, route.clone()) {
                Some(subscription) => {
                    debug!(connection = %session.id, route = %route, "route registered");
                    Response::ok(json!({
                        "subscribed": route,
                        "mode": "register",
                        "topic": subscription.topic,
                    }))
                    .to_json()
                }
                None => Response::from_error(&Error::MalformedMessage(
                    "connection is not open".to_string(),
                ))
                .to_json(),
            },
            SubscribeMode::Poll => {
                let every = request
                    .interval
                    .map(Duration::from_millis)
                    .unwrap_or(self.default_poll_interval)
                    .max(Duration::from_millis(1));
                let poll = Poll {
                    connection: session.id,
                    outbound: session.outbound.clone(),
                    route: route.clone(),
                    method,
                    every,
                    lifetime: request.timeout.map(Duration::from_millis),
                    request,
                };

                session.polls.spawn(Arc::clone(self).poll(poll));
                debug!(connection = %session.id, route = %route, interval_ms = every.as_millis() as u64, "poll started");

                Response::ok(json!({
                    "subscribed": route,
                    "mode": "poll",
                    "interval": every.as_millis() as u64,
                }))
                .to_json()
            }
        }
    }

    async fn poll(self: Arc<Self>, poll: Poll) {
        let mut ticker = tokio::time::interval(poll.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first immediate tick
        ticker.tick().await;

        let expiry = async {
            match poll.lifetime {
                Some(lifetime) => tokio::time::sleep(lifetime).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = &mut expiry => {
                    debug!(connection = %poll.connection, route = %poll.route, "poll timed out");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let response = self.run_query(&poll.route, poll.method, &poll.request).await;
            let failed = !response.success;
            if poll.outbound.send(response.to_json()).await.is_err() {
                break;
            }
            if failed && poll.request.throw_on_error {
                debug!(connection = %poll.connection, route = %poll.route, "poll stopped on error");
                break;
            }
        }
    }

    // =========================================================================
    // Queue
    // =========================================================================

    async fn handle_queue(&self, connection: ConnectionId, route: &Route, request: &Request) -> Result<Value> {
        let mount = self.registry.resolve(route.database())?;
        let db = &mount.database;

        let op = request
            .op
            .ok_or_else(|| Error::MalformedMessage("queue message needs an 'op'".to_string()))?;

        match op {
            QueueOp::Enqueue => {
                let topic = request
                    .topic
                    .as_deref()
                    .ok_or_else(|| Error::MalformedMessage("enqueue needs a 'topic'".to_string()))?;
                let payload = request.payload.clone().unwrap_or(Value::Null);
                let id = db.enqueue(topic, payload, request.priority.unwrap_or(0)).await?;
                Ok(json!({ "id": id }))
            }
            QueueOp::Dequeue => {
                let claimant = request
                    .claimant
                    .clone()
                    .unwrap_or_else(|| connection.to_string());
                let item = db.dequeue(&claimant, request.topic.as_deref()).await?;
                Ok(serde_json::to_value(item)?)
            }
            QueueOp::Ack => {
                let item = db.ack(queue_id(request)?).await?;
                Ok(serde_json::to_value(item)?)
            }
            QueueOp::Fail => {
                let reason = request.reason.as_deref().unwrap_or_default();
                let item = db.fail(queue_id(request)?, reason).await?;
                Ok(serde_json::to_value(item)?)
            }
        }
    }
}

struct Poll {
    connection: ConnectionId,
    outbound: mpsc::Sender<String>,
    route: Route,
    method: Method,
    request: Request,
    every: Duration,
    lifetime: Option<Duration>,
}

// =============================================================================
// Method handlers
// =============================================================================

async fn read(mount: &MountedDatabase, route: &Route, method: Method) -> Result<Value> {
    let db = &mount.database;
    let Some(table) = route.table() else {
        return Ok(json!({}));
    };

    if !db.has_table(table).await {
        return match mount.alias(table) {
            Some(alias) if alias.accepts(method) => Ok(json!({})),
            _ => Err(Error::RouteNotFound(table.to_string())),
        };
    }

    let data = db.get_table_data(table).await?;
    let Some(key) = route.key() else {
        return Ok(rows_value(data.rows));
    };
    if data.rows.is_empty() {
        return Err(Error::TableEmpty(table.to_string()));
    }

    let Some(column) = data.primary_key else {
        return Ok(json!([]));
    };
    let matching = data
        .rows
        .into_iter()
        .filter(|row| row.get(&column).and_then(crate::query::key_text).as_deref() == Some(key))
        .collect();
    Ok(rows_value(matching))
}

async fn insert(mount: &MountedDatabase, route: &Route, request: &Request) -> Result<Value> {
    let db = &mount.database;
    let table = route.table().ok_or(Error::InvalidRoute)?;
    let rows = request.data.clone().unwrap_or_default();
    let ttl = request.ttl.map(Duration::from_millis);
    if let Some(ttl) = ttl {
        expiry_deadline(ttl)?;
    }

    let stored = db
        .insert_data(table, rows, request.on_conflict.unwrap_or_default())
        .await?;

    if let Some(ttl) = ttl {
        if let Err(e) = db.expire_rows(table, &stored, ttl).await {
            warn!(database = %db.name(), table, error = %e, "failed to record row expiration");
        }
    }
    Ok(rows_value(stored))
}

async fn create(mount: &MountedDatabase, route: &Route, request: &Request) -> Result<Value> {
    let table = route.table().ok_or(Error::InvalidRoute)?;
    let descriptor = TableDescriptor::new(table, request.columns.clone().unwrap_or_default());
    let seed = request.data.clone().unwrap_or_default();

    let created = mount
        .database
        .create_table(descriptor, seed, request.on_conflict.unwrap_or_default())
        .await?;
    Ok(serde_json::to_value(created)?)
}

async fn update(mount: &MountedDatabase, route: &Route, request: &Request) -> Result<Value> {
    let table = route.table().ok_or(Error::InvalidRoute)?;
    let key = route.key().ok_or_else(|| {
        Error::MalformedMessage(format!("PATCH needs a key: {}/{table}/{{key}}", route.database()))
    })?;
    let changes = request
        .data
        .as_ref()
        .and_then(|rows| rows.first())
        .filter(|row| !row.is_empty())
        .cloned()
        .ok_or(Error::EmptyPayload)?;

    let updated = mount.database.update_by_key(table, key, changes).await?;
    Ok(rows_value(updated))
}

async fn remove(mount: &MountedDatabase, route: &Route) -> Result<Value> {
    let db = &mount.database;
    match (route.table(), route.key()) {
        (None, _) => {
            let dropped = db.delete_all_tables().await?;
            Ok(json!({ "dropped": dropped }))
        }
        (Some(table), Some(key)) => Ok(rows_value(db.delete_by_key(table, key).await?)),
        (Some(table), None) => {
            if !db.has_table(table).await {
                return Err(Error::RouteNotFound(table.to_string()));
            }
            db.delete_table(table).await?;
            Ok(json!({ "dropped": [table] }))
        }
    }
}

fn queue_id(request: &Request) -> Result<&str> {
    request
        .id
        .as_deref()
        .ok_or_else(|| Error::MalformedMessage("queue message needs an 'id'".to_string()))
}

fn rows_value(rows: Vec<Row>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

fn log_failure(err: &Error, route: &Route, method: &str) {
    if err.is_client_error() {
        debug!(route = %route, method, error = %err, "request rejected");
    } else {
        warn!(route = %route, method, error = %err, "request failed");
    }
}
