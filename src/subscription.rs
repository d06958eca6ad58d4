//! # Subscriptions & Broadcast
//!
//! Connections can register interest in a route. After every successful
//! POST, PUT, PATCH or DELETE the router hands a [`ChangeNotification`] to
//! the [`SubscriptionManager`], which pushes it to every connection holding a
//! registered route that is a segment-wise prefix of the affected route.
//!
//! ```text
//! registered           affected             delivered?
//! shop                 shop/orders/1        yes
//! shop/orders          shop/orders          yes
//! shop/orders          shop/orders/1        yes
//! shop/orders          shop/orders_archive  no
//! shop/orders/1        shop/orders          no
//! ```
//!
//! ## Backpressure
//!
//! Each connection has one bounded outbound channel, shared by responses,
//! poll results and broadcasts. A broadcast is offered with `try_send`: if a
//! connection's channel is full, that connection misses the notification and
//! a warning is logged. Nobody else waits. A closed channel means the
//! connection is gone and it is removed.
//!
//! Polling subscriptions do not live here; they are tasks owned by the
//! connection (see `router`).

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::route::Route;
use crate::types::{ConnectionId, Method};

/// A registered interest in a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub connection: ConnectionId,
    pub route: Route,
    /// Table segment of the route, or the database when there is none.
    pub topic: String,
}

impl Subscription {
    pub fn new(connection: ConnectionId, route: Route) -> Self {
        let topic = route.table().unwrap_or(route.database()).to_string();
        Self {
            connection,
            route,
            topic,
        }
    }

    pub fn matches(&self, affected: &Route) -> bool {
        self.route.is_prefix_of(affected)
    }
}

/// The `{type:"update", method, data, route}` push message.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeNotification {
    #[serde(rename = "type")]
    kind: &'static str,
    pub method: Method,
    pub data: Value,
    pub route: Route,
}

impl ChangeNotification {
    pub fn new(method: Method, route: Route, data: Value) -> Self {
        Self {
            kind: "update",
            method,
            data,
            route,
        }
    }
}

/// Counts from one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Connections the notification was queued for.
    pub sent: usize,
    /// Matching connections whose channel was full.
    pub dropped: usize,
    /// Matching connections found closed and removed.
    pub disconnected: usize,
}

struct ClientState {
    tx: mpsc::Sender<String>,
    subscriptions: Vec<Subscription>,
}

/// Registry of connections and their registered routes.
#[derive(Default)]
pub struct SubscriptionManager {
    clients: RwLock<HashMap<ConnectionId, ClientState>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and the sender of its outbound channel.
    pub fn add_client(&self, id: ConnectionId, tx: mpsc::Sender<String>) {
        self.clients.write().insert(
            id,
            ClientState {
                tx,
                subscriptions: Vec::new(),
            },
        );
        debug!(connection = %id, "client registered");
    }

    /// Forgets a connection and every subscription it held. Returns how many
    /// subscriptions were dropped, or `None` if the connection was unknown.
    pub fn remove_client(&self, id: ConnectionId) -> Option<usize> {
        let removed = self.clients.write().remove(&id)?;
        debug!(connection = %id, subscriptions = removed.subscriptions.len(), "client removed");
        Some(removed.subscriptions.len())
    }

    /// Registers `route` for `id`. Registering the same route twice is a
    /// no-op. Returns `None` if the connection is not registered.
    pub fn subscribe(&self, id: ConnectionId, route: Route) -> Option<Subscription> {
        let mut clients = self.clients.write();
        let client = clients.get_mut(&id)?;

        let subscription = Subscription::new(id, route);
        if !client.subscriptions.contains(&subscription) {
            client.subscriptions.push(subscription.clone());
        }
        Some(subscription)
    }

    /// The routes registered by one connection.
    pub fn subscriptions(&self, id: ConnectionId) -> Vec<Subscription> {
        self.clients
            .read()
            .get(&id)
            .map(|c| c.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.clients.read().values().map(|c| c.subscriptions.len()).sum()
    }

    /// Pushes `notification` to every connection with a matching route.
    ///
    /// Serializes once. A connection is sent the message at most once even
    /// if several of its routes match.
    pub fn broadcast(&self, notification: &ChangeNotification) -> BroadcastResult {
        let mut result = BroadcastResult::default();

        let message = match serde_json::to_string(notification) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to serialize change notification");
                return result;
            }
        };

        let clients = self.clients.read();
        let mut disconnected = Vec::new();

        for (&id, client) in clients.iter() {
            if !client.subscriptions.iter().any(|s| s.matches(&notification.route)) {
                continue;
            }
            match client.tx.try_send(message.clone()) {
                Ok(()) => result.sent += 1,
                Err(TrySendError::Full(_)) => {
                    result.dropped += 1;
                    warn!(connection = %id, route = %notification.route, "outbound queue full, notification dropped");
                }
                Err(TrySendError::Closed(_)) => disconnected.push(id),
            }
        }
        drop(clients);

        // Remove disconnected clients outside the read lock.
        if !disconnected.is_empty() {
            let mut clients = self.clients.write();
            for id in &disconnected {
                clients.remove(id);
                debug!(connection = %id, "closed client removed during broadcast");
            }
        }
        result.disconnected = disconnected.len();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route(s: &str) -> Route {
        Route::parse(s).unwrap()
    }

    fn notify(method: Method, r: &str) -> ChangeNotification {
        ChangeNotification::new(method, route(r), json!([{"id": 1}]))
    }

    #[test]
    fn test_notification_wire_shape() {
        let value = serde_json::to_value(notify(Method::Post, "shop/orders")).unwrap();
        assert_eq!(
            value,
            json!({"type": "update", "method": "POST", "data": [{"id": 1}], "route": "shop/orders"})
        );
    }

    #[test]
    fn test_topic_is_table_or_database() {
        let id = ConnectionId::new(1);
        assert_eq!(Subscription::new(id, route("shop/orders/1")).topic, "orders");
        assert_eq!(Subscription::new(id, route("shop")).topic, "shop");
    }

    #[tokio::test]
    async fn test_broadcast_prefix_matching() {
        let manager = SubscriptionManager::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        manager.add_client(a, tx_a);
        manager.add_client(b, tx_b);
        manager.subscribe(a, route("shop/orders"));
        manager.subscribe(b, route("shop/orders_archive"));

        let result = manager.broadcast(&notify(Method::Delete, "shop/orders/1"));
        assert_eq!(result.sent, 1);

        let got: Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(got["route"], "shop/orders/1");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_one_message_per_connection() {
        let manager = SubscriptionManager::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = ConnectionId::new(1);
        manager.add_client(id, tx);
        manager.subscribe(id, route("shop"));
        manager.subscribe(id, route("shop/orders"));
        manager.subscribe(id, route("shop/orders"));

        assert_eq!(manager.subscription_count(), 2);
        manager.broadcast(&notify(Method::Post, "shop/orders"));

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_channel_drops_for_that_client_only() {
        let manager = SubscriptionManager::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, _fast_rx) = mpsc::channel(8);
        let slow = ConnectionId::new(1);
        let fast = ConnectionId::new(2);
        manager.add_client(slow, slow_tx);
        manager.add_client(fast, fast_tx);
        manager.subscribe(slow, route("shop"));
        manager.subscribe(fast, route("shop"));

        manager.broadcast(&notify(Method::Post, "shop/orders"));
        let second = manager.broadcast(&notify(Method::Post, "shop/orders"));

        assert_eq!(second, BroadcastResult { sent: 1, dropped: 1, disconnected: 0 });
        assert_eq!(manager.client_count(), 2);
    }

    #[test]
    fn test_closed_client_removed() {
        let manager = SubscriptionManager::new();
        let (tx, rx) = mpsc::channel(8);
        let id = ConnectionId::new(1);
        manager.add_client(id, tx);
        manager.subscribe(id, route("shop"));
        drop(rx);

        let result = manager.broadcast(&notify(Method::Put, "shop/orders"));
        assert_eq!(result.disconnected, 1);
        assert_eq!(manager.client_count(), 0);
        assert_eq!(manager.remove_client(id), None);
    }

    #[test]
    fn test_subscribe_requires_registered_client() {
        let manager = SubscriptionManager::new();
        assert!(manager.subscribe(ConnectionId::new(9), route("shop")).is_none());
    }
}
