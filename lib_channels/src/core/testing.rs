//! In-memory transport for exercising the connection state machine without a
//! network. Every `open` call yields a [`FakeSocket`] the test drives by hand.

use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;

use crate::core::connection::Connection;
use crate::core::transport::{CloseInfo, Connector, Frame, TransportEvent, TransportHandle};
use crate::error::TransportError;
use crate::models::ConnectionState;

/// Connector that hands every opened transport to the test.
pub(crate) struct FakeConnector {
    opened: mpsc::UnboundedSender<FakeSocket>,
}

/// Transports opened by a [`FakeConnector`], in order.
pub(crate) struct FakeSockets {
    opened: mpsc::UnboundedReceiver<FakeSocket>,
}

/// The server side of one fake transport. Dropping it ends the transport
/// like a lost network connection would.
pub(crate) struct FakeSocket {
    pub url: Url,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Frame>,
}

pub(crate) fn fake_connector() -> (FakeConnector, FakeSockets) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FakeConnector { opened: tx }, FakeSockets { opened: rx })
}

impl Connector for FakeConnector {
    fn open(&self, url: &Url) -> TransportHandle {
        let (handle, peer) = TransportHandle::pair();
        let _ = self.opened.send(FakeSocket {
            url: url.clone(),
            events: peer.events,
            outbound: peer.outbound,
        });
        handle
    }
}

impl FakeSockets {
    /// Waits for the next transport to be opened.
    pub async fn next(&mut self) -> FakeSocket {
        tokio::time::timeout(Duration::from_secs(600), self.opened.recv())
            .await
            .expect("timed out waiting for a transport to open")
            .expect("connector dropped")
    }

    /// The next opened transport, if one is already waiting.
    pub fn try_next(&mut self) -> Option<FakeSocket> {
        self.opened.try_recv().ok()
    }
}

impl FakeSocket {
    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Open);
    }

    pub fn message(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Message(text.to_string()));
    }

    pub fn error(&self, message: &str) {
        let _ = self.events.send(TransportEvent::Error(TransportError::new(message)));
    }

    /// Server-side close without a local request.
    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed(CloseInfo {
            code: Some(1006),
            reason: "server went away".to_string(),
            initiated_locally: false,
        }));
    }

    /// Next frame the client wrote, or `None` once the client side is gone.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(600), self.outbound.recv())
            .await
            .expect("timed out waiting for a frame")
    }

    pub fn try_frame(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }
}

/// Waits (in virtual time) until `conn` reaches `target`.
pub(crate) async fn wait_for_state(conn: &Connection, target: ConnectionState) {
    let mut rx = conn.watch_state();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}, still {}", conn.state()))
        .expect("state channel closed");
}
