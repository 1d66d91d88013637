//! # Channel Registry
//!
//! A keyed collection of [`Connection`]s. At most one connection exists per
//! logical id; `connect` on a known id returns the existing handle instead of
//! opening a second transport.
//!
//! The map lock guards membership only. Connection teardown and every user
//! callback run outside of it, so a callback may call back into the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::core::connection::{Connection, ConnectionHandlers, ConnectionOptions, SubscriptionId};
use crate::core::endpoint::parse_channel_url;
use crate::core::transport::{Connector, TungsteniteConnector};
use crate::error::ChannelError;
use crate::models::{ConnectionState, ConnectionStatus, InboundMessage};

struct RegistryInner {
    connections: Mutex<HashMap<String, Connection>>,
    connector: Arc<dyn Connector>,
}

impl RegistryInner {
    fn connections(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let connections: Vec<Connection> = self
            .connections
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.shutdown();
        }
    }
}

/// Keyed registry of logical channels.
///
/// Cloning is cheap and every clone shares the same connections. When the
/// last clone is dropped every remaining connection is torn down.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.ids())
            .finish()
    }
}

impl ChannelRegistry {
    /// A registry that opens real WebSocket connections.
    pub fn new() -> Self {
        Self::with_connector(TungsteniteConnector)
    }

    /// A registry backed by a custom transport.
    pub fn with_connector(connector: impl Connector) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: Mutex::new(HashMap::new()),
                connector: Arc::new(connector),
            }),
        }
    }

    /// Ensures a connection for `id` exists and returns it.
    ///
    /// If `id` is already registered the existing connection is returned and
    /// `url`, `handlers` and `options` are ignored. Otherwise a new connection
    /// is created in `Connecting` state; it opens in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        &self,
        id: &str,
        url: &str,
        handlers: ConnectionHandlers,
        options: ConnectionOptions,
    ) -> Result<Connection, ChannelError> {
        if id.is_empty() {
            return Err(ChannelError::InvalidChannelId);
        }

        let mut connections = self.inner.connections();
        if let Some(existing) = connections.get(id) {
            tracing::debug!(channel = id, "Channel already registered, reusing connection");
            return Ok(existing.clone());
        }

        let url = parse_channel_url(url)?;
        tracing::info!(channel = id, url = %url, "Connecting channel");

        let conn = Connection::spawn(id, url, handlers, options, Arc::clone(&self.inner.connector));
        connections.insert(id.to_string(), conn.clone());
        Ok(conn)
    }

    /// Closes the connection for `id`, cancels any pending reconnect and
    /// removes it from the registry.
    pub fn disconnect(&self, id: &str) -> Result<(), ChannelError> {
        let conn = self
            .inner
            .connections()
            .remove(id)
            .ok_or_else(|| ChannelError::ConnectionNotFound(id.to_string()))?;
        conn.shutdown();
        Ok(())
    }

    /// Tears down every registered connection.
    pub fn disconnect_all(&self) {
        let drained: Vec<Connection> = self.inner.connections().drain().map(|(_, conn)| conn).collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Disconnecting all channels");
        }
        for conn in drained {
            conn.shutdown();
        }
    }

    /// Writes a raw text frame on the connection for `id`.
    pub fn send(&self, id: &str, text: impl Into<String>) -> Result<(), ChannelError> {
        self.get(id)?.send(text)
    }

    /// Serializes `data` to JSON and writes it on the connection for `id`.
    pub fn send_json<T: Serialize + ?Sized>(&self, id: &str, data: &T) -> Result<(), ChannelError> {
        self.get(id)?.send_json(data)
    }

    /// Adds a message subscriber to the connection for `id`.
    pub fn receive(
        &self,
        id: &str,
        handler: impl Fn(&InboundMessage) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ChannelError> {
        Ok(self.get(id)?.subscribe(handler))
    }

    /// Removes a subscriber added with [`receive`](Self::receive).
    pub fn unsubscribe(&self, id: &str, subscription: SubscriptionId) -> Result<bool, ChannelError> {
        Ok(self.get(id)?.unsubscribe(subscription))
    }

    /// Restarts a connection whose reconnect attempts are exhausted and
    /// returns its resulting state.
    pub fn reconnect(&self, id: &str) -> Result<ConnectionState, ChannelError> {
        Ok(self.get(id)?.restart())
    }

    /// Handle for `id`, or [`ChannelError::ConnectionNotFound`].
    pub fn get(&self, id: &str) -> Result<Connection, ChannelError> {
        self.inner
            .connections()
            .get(id)
            .cloned()
            .ok_or_else(|| ChannelError::ConnectionNotFound(id.to_string()))
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.connections().contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.get(id).ok().map(|conn| conn.status())
    }

    /// Status of every registered connection, ordered by id.
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        let conns: Vec<Connection> = self.inner.connections().values().cloned().collect();
        let mut statuses: Vec<ConnectionStatus> = conns.iter().map(Connection::status).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.connections().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reconnect::ExponentialBackoff;
    use crate::core::testing::{fake_connector, wait_for_state, FakeSockets};
    use crate::core::transport::{CloseInfo, Frame};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const URL: &str = "ws://localhost:8080/ws/channel";

    fn registry() -> (ChannelRegistry, FakeSockets) {
        let (connector, sockets) = fake_connector();
        (ChannelRegistry::with_connector(connector), sockets)
    }

    fn fast(max_attempts: u32) -> ConnectionOptions {
        ConnectionOptions::fixed(Duration::from_millis(100), max_attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent_per_id() {
        let (registry, mut sockets) = registry();

        let first = registry.connect("billing_client", URL, ConnectionHandlers::new(), fast(5)).unwrap();
        let second = registry
            .connect("billing_client", "ws://elsewhere/ws/other", ConnectionHandlers::new(), fast(1))
            .unwrap();

        assert!(Connection::ptr_eq(&first, &second));
        assert_eq!(second.url().as_str(), URL);
        assert_eq!(registry.len(), 1);

        let socket = sockets.next().await;
        assert_eq!(socket.url.as_str(), URL);
        tokio::task::yield_now().await;
        assert!(sockets.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejects_bad_input() {
        let (registry, _sockets) = registry();

        assert!(matches!(
            registry.connect("", URL, ConnectionHandlers::new(), fast(1)),
            Err(ChannelError::InvalidChannelId)
        ));
        assert!(matches!(
            registry.connect("x", "http://localhost/ws", ConnectionHandlers::new(), fast(1)),
            Err(ChannelError::InvalidUrl { .. })
        ));
        assert!(matches!(
            registry.connect("x", "not a url", ConnectionHandlers::new(), fast(1)),
            Err(ChannelError::InvalidUrl { .. })
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_id_operations() {
        let (registry, _sockets) = registry();

        assert!(!registry.has("ghost"));
        assert!(matches!(registry.get("ghost"), Err(ChannelError::ConnectionNotFound(id)) if id == "ghost"));
        assert!(matches!(registry.send("ghost", "x"), Err(ChannelError::ConnectionNotFound(id)) if id == "ghost"));
        assert!(matches!(registry.disconnect("ghost"), Err(ChannelError::ConnectionNotFound(_))));
        assert!(matches!(registry.receive("ghost", |_| {}), Err(ChannelError::ConnectionNotFound(_))));
        assert!(matches!(registry.reconnect("ghost"), Err(ChannelError::ConnectionNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_clean_teardown() {
        let (registry, mut sockets) = registry();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let handlers = ConnectionHandlers::new().on_close(move |info: &CloseInfo| {
            assert!(info.initiated_locally);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let conn = registry.connect("billing_client", URL, handlers, fast(5)).unwrap();
        let mut socket = sockets.next().await;
        socket.open();
        wait_for_state(&conn, ConnectionState::Open).await;

        registry.disconnect("billing_client").unwrap();
        assert!(!registry.has("billing_client"));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(socket.next_frame().await, Some(Frame::Close));
        assert!(matches!(registry.send("billing_client", "x"), Err(ChannelError::ConnectionNotFound(_))));

        // Late server events and elapsed reconnect intervals change nothing.
        socket.close();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sockets.try_next().is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (registry, mut sockets) = registry();
        let conn = registry.connect("billing_client", URL, ConnectionHandlers::new(), fast(5)).unwrap();

        let socket = sockets.next().await;
        socket.open();
        socket.close();
        wait_for_state(&conn, ConnectionState::ReconnectScheduled).await;

        registry.disconnect("billing_client").unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sockets.try_next().is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_bounded() {
        let (registry, mut sockets) = registry();
        let closes = Arc::new(AtomicUsize::new(0));
        let exhausted = Arc::new(AtomicU32::new(u32::MAX));
        let exhausted_calls = Arc::new(AtomicUsize::new(0));

        let (c, e, n) = (Arc::clone(&closes), Arc::clone(&exhausted), Arc::clone(&exhausted_calls));
        let handlers = ConnectionHandlers::new()
            .on_close(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_exhausted(move |attempts| {
                e.store(attempts, Ordering::SeqCst);
                n.fetch_add(1, Ordering::SeqCst);
            });

        let conn = registry.connect("billing_client", URL, handlers, fast(2)).unwrap();

        let first = sockets.next().await;
        first.open();
        wait_for_state(&conn, ConnectionState::Open).await;
        first.close();

        // Both replacement transports fail to open.
        let second = sockets.next().await;
        second.close();
        let third = sockets.next().await;
        third.close();

        wait_for_state(&conn, ConnectionState::Exhausted).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sockets.try_next().is_none());

        assert_eq!(conn.reconnect_attempts(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 3);
        assert_eq!(exhausted.load(Ordering::SeqCst), 2);
        assert_eq!(exhausted_calls.load(Ordering::SeqCst), 1);
        // An exhausted connection stays registered.
        assert!(registry.has("billing_client"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_the_configured_interval() {
        let (registry, mut sockets) = registry();
        let conn = registry
            .connect("billing_client", URL, ConnectionHandlers::new(), ConnectionOptions::default())
            .unwrap();

        let first = sockets.next().await;
        first.open();
        wait_for_state(&conn, ConnectionState::Open).await;

        let closed_at = tokio::time::Instant::now();
        first.close();
        let _second = sockets.next().await;
        let waited = closed_at.elapsed();
        assert!(waited >= Duration::from_millis(5000), "reconnected after {:?}", waited);
        assert!(waited < Duration::from_millis(5100), "reconnected after {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_policy_spaces_attempts() {
        let (registry, mut sockets) = registry();
        let options = ConnectionOptions::default().with_policy(ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            3,
        ));
        let conn = registry.connect("billing_client", URL, ConnectionHandlers::new(), options).unwrap();

        let mut socket = sockets.next().await;
        let mut gaps = Vec::new();
        for _ in 0..3 {
            let closed_at = tokio::time::Instant::now();
            socket.close();
            socket = sockets.next().await;
            gaps.push(closed_at.elapsed());
        }
        socket.close();
        wait_for_state(&conn, ConnectionState::Exhausted).await;

        for (gap, expected_ms) in gaps.iter().zip([100u64, 200, 400]) {
            let expected = Duration::from_millis(expected_ms);
            assert!(*gap >= expected && *gap < expected + Duration::from_millis(50), "gap {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_json_writes_serialized_frame() {
        let (registry, mut sockets) = registry();
        let conn = registry.connect("billing_client", URL, ConnectionHandlers::new(), fast(5)).unwrap();

        let mut socket = sockets.next().await;
        assert!(matches!(
            registry.send_json("billing_client", &serde_json::json!({"a": 1})),
            Err(ChannelError::SendOnNonOpenSocket { .. })
        ));

        socket.open();
        wait_for_state(&conn, ConnectionState::Open).await;
        registry.send_json("billing_client", &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(socket.next_frame().await, Some(Frame::Text(r#"{"a":1}"#.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_during_reconnect_is_rejected() {
        let (registry, mut sockets) = registry();
        let conn = registry.connect("billing_client", URL, ConnectionHandlers::new(), fast(5)).unwrap();

        let socket = sockets.next().await;
        socket.open();
        socket.close();
        wait_for_state(&conn, ConnectionState::ReconnectScheduled).await;

        match registry.send("billing_client", "lost") {
            Err(ChannelError::SendOnNonOpenSocket { state, .. }) => {
                assert_eq!(state, ConnectionState::ReconnectScheduled)
            }
            other => panic!("expected SendOnNonOpenSocket, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_are_independent() {
        let (registry, mut sockets) = registry();
        let a = registry.connect("a", "ws://localhost/ws/a", ConnectionHandlers::new(), fast(5)).unwrap();
        let b = registry.connect("b", "ws://localhost/ws/b", ConnectionHandlers::new(), fast(5)).unwrap();

        let (a_tx, mut a_rx) = mpsc::unbounded_channel::<String>();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel::<String>();
        registry
            .receive("a", move |msg| {
                let _ = a_tx.send(msg.text().to_string());
            })
            .unwrap();
        registry
            .receive("b", move |msg| {
                let _ = b_tx.send(msg.text().to_string());
            })
            .unwrap();

        let sock_a = sockets.next().await;
        let mut sock_b = sockets.next().await;
        assert_eq!(sock_a.url.path(), "/ws/a");
        sock_a.open();
        sock_b.open();
        wait_for_state(&a, ConnectionState::Open).await;
        wait_for_state(&b, ConnectionState::Open).await;

        sock_a.close();
        wait_for_state(&a, ConnectionState::ReconnectScheduled).await;
        assert_eq!(b.state(), ConnectionState::Open);

        sock_b.message("for b");
        assert_eq!(b_rx.recv().await.as_deref(), Some("for b"));
        assert!(a_rx.try_recv().is_err());

        registry.send("b", "still here").unwrap();
        assert_eq!(sock_b.next_frame().await, Some(Frame::Text("still here".into())));

        let sock_a = sockets.next().await;
        assert_eq!(sock_a.url.path(), "/ws/a");
        sock_a.open();
        wait_for_state(&a, ConnectionState::Open).await;
        sock_a.message("for a");
        assert_eq!(a_rx.recv().await.as_deref(), Some("for a"));
        assert!(b_rx.try_recv().is_err());

        registry.disconnect("a").unwrap();
        assert_eq!(registry.ids(), vec!["b".to_string()]);
        assert_eq!(b.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_subscribers_survive_reconnect() {
        let (registry, mut sockets) = registry();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let conn = registry.connect("billing_client", URL, ConnectionHandlers::new(), fast(5)).unwrap();

        let sub = registry
            .receive("billing_client", move |msg| {
                let _ = seen_tx.send(msg.text().to_string());
            })
            .unwrap();

        let first = sockets.next().await;
        first.open();
        first.message("before");
        assert_eq!(seen_rx.recv().await.as_deref(), Some("before"));

        first.close();
        let second = sockets.next().await;
        second.open();
        wait_for_state(&conn, ConnectionState::Open).await;
        second.message("after");
        assert_eq!(seen_rx.recv().await.as_deref(), Some("after"));

        assert!(registry.unsubscribe("billing_client", sub).unwrap());
        assert_eq!(conn.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_exhaustion() {
        let (registry, mut sockets) = registry();
        let conn = registry.connect("billing_client", URL, ConnectionHandlers::new(), fast(1)).unwrap();

        sockets.next().await.close();
        sockets.next().await.close();
        wait_for_state(&conn, ConnectionState::Exhausted).await;

        assert_eq!(registry.reconnect("billing_client").unwrap(), ConnectionState::Connecting);
        let fresh = sockets.next().await;
        fresh.open();
        wait_for_state(&conn, ConnectionState::Open).await;
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statuses_are_sorted() {
        let (registry, mut sockets) = registry();
        registry.connect("zeta", URL, ConnectionHandlers::new(), fast(5)).unwrap();
        let alpha = registry.connect("alpha", URL, ConnectionHandlers::new(), fast(5)).unwrap();

        let _zeta_socket = sockets.next().await;
        let alpha_socket = sockets.next().await;
        alpha_socket.open();
        wait_for_state(&alpha, ConnectionState::Open).await;

        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "alpha");
        assert_eq!(statuses[0].state, ConnectionState::Open);
        assert_eq!(statuses[1].id, "zeta");
        assert_eq!(statuses[1].state, ConnectionState::Connecting);
        assert_eq!(registry.status("alpha"), Some(statuses[0].clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_disconnect_its_own_channel() {
        let (registry, mut sockets) = registry();
        let handle = registry.clone();
        let handlers = ConnectionHandlers::new().on_message(move |msg| {
            if msg.text() == "bye" {
                let _ = handle.disconnect("billing_client");
            }
        });
        let conn = registry.connect("billing_client", URL, handlers, fast(5)).unwrap();

        let socket = sockets.next().await;
        socket.open();
        socket.message("bye");
        wait_for_state(&conn, ConnectionState::Closed).await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_registry_tears_down_connections() {
        let (registry, mut sockets) = registry();
        let conn = registry.connect("billing_client", URL, ConnectionHandlers::new(), fast(5)).unwrap();

        let socket = sockets.next().await;
        socket.open();
        socket.close();
        wait_for_state(&conn, ConnectionState::ReconnectScheduled).await;

        drop(registry);
        assert_eq!(conn.state(), ConnectionState::Closed);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sockets.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all() {
        let (registry, mut sockets) = registry();
        let a = registry.connect("a", URL, ConnectionHandlers::new(), fast(5)).unwrap();
        let b = registry.connect("b", URL, ConnectionHandlers::new(), fast(5)).unwrap();
        let _sa = sockets.next().await;
        let _sb = sockets.next().await;

        registry.disconnect_all();
        assert!(registry.is_empty());
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_end_to_end_over_websocket() {
        use futures_util::{SinkExt, StreamExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });

        let registry = ChannelRegistry::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let handlers = ConnectionHandlers::new().on_message(move |msg| {
            let _ = seen_tx.send(msg.text().to_string());
        });
        let conn = registry
            .connect("echo", &format!("ws://{}/ws/echo", addr), handlers, ConnectionOptions::default())
            .unwrap();

        wait_for_state(&conn, ConnectionState::Open).await;
        registry
            .send_json("echo", &crate::models::OutboundCommand::new("refresh", serde_json::json!({"page": 1})))
            .unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&echoed).unwrap();
        assert_eq!(value["action"], "refresh");
        assert_eq!(value["payload"]["page"], 1);

        registry.disconnect("echo").unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
