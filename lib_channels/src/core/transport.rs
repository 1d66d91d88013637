//! # Transport Seam
//!
//! A [`Connector`] creates one transport connection per call and returns a
//! [`TransportHandle`] straight away. The socket work runs in the background
//! and is reported as a stream of [`TransportEvent`]s, ending with exactly one
//! `Closed`. Writes go through the handle's outbound channel, so a write is a
//! synchronous, non-blocking enqueue that preserves call order.
//!
//! [`TungsteniteConnector`] is the production implementation on top of
//! `tokio-tungstenite`. Tests substitute a fake that never touches the network.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::error::TransportError;

/// A frame queued for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text frame.
    Text(String),
    /// Close the socket gracefully.
    Close,
}

/// Why a transport ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// Close code sent by the peer, when there was a close frame.
    pub code: Option<u16>,
    /// Close reason or a short local description.
    pub reason: String,
    /// `true` when this side asked for the close.
    pub initiated_locally: bool,
}

impl CloseInfo {
    /// A close this side asked for.
    pub fn local(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            initiated_locally: true,
        }
    }

    /// A close without a close frame from the peer (network drop, failed connect).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            initiated_locally: false,
        }
    }
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket finished its handshake.
    Open,
    /// A text frame arrived.
    Message(String),
    /// A socket failure. Does not by itself end the transport.
    Error(TransportError),
    /// The transport ended. Always the last event.
    Closed(CloseInfo),
}

/// The caller's side of one transport connection.
#[derive(Debug)]
pub struct TransportHandle {
    /// Frames to write, in order.
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Events reported by the socket task.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The socket task's side of one transport connection.
#[derive(Debug)]
pub struct TransportPeer {
    /// Frames the caller wants written.
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    /// Where to report events.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportHandle {
    /// Creates a connected handle/peer pair.
    pub fn pair() -> (TransportHandle, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            TransportHandle {
                outbound: out_tx,
                events: ev_rx,
            },
            TransportPeer {
                outbound: out_rx,
                events: ev_tx,
            },
        )
    }
}

/// Opens transport connections. Must not block: the handshake happens in the
/// background and is reported through the handle's events.
pub trait Connector: Send + Sync + 'static {
    /// Starts a new connection to `url`.
    fn open(&self, url: &Url) -> TransportHandle;
}

/// WebSocket transport backed by `tokio-tungstenite`. Requires a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn open(&self, url: &Url) -> TransportHandle {
        let (handle, peer) = TransportHandle::pair();
        tokio::spawn(run_socket(url.clone(), peer));
        handle
    }
}

async fn run_socket(url: Url, mut peer: TransportPeer) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "WebSocket connect failed");
            let _ = peer.events.send(TransportEvent::Error(e.into()));
            let _ = peer.events.send(TransportEvent::Closed(CloseInfo::abnormal("connect failed")));
            return;
        }
    };

    if peer.events.send(TransportEvent::Open).is_err() {
        // Nobody is listening any more.
        return;
    }

    let (mut write, mut read) = stream.split();

    let close = loop {
        tokio::select! {
            frame = peer.outbound.recv() => match frame {
                Some(Frame::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        let _ = peer.events.send(TransportEvent::Error(e.into()));
                        break CloseInfo::abnormal("write failed");
                    }
                }
                Some(Frame::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break CloseInfo::local("closed by client");
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if peer.events.send(TransportEvent::Message(text.as_str().to_owned())).is_err() {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    tracing::debug!(url = %url, len = bytes.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => CloseInfo {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.as_str().to_owned(),
                            initiated_locally: false,
                        },
                        None => CloseInfo::abnormal("closed by server"),
                    };
                }
                // Ping/Pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = peer.events.send(TransportEvent::Error(e.into()));
                    break CloseInfo::abnormal("read failed");
                }
                None => break CloseInfo::abnormal("stream ended"),
            }
        }
    };

    let _ = peer.events.send(TransportEvent::Closed(close));
}
