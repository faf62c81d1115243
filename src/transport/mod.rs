//! Transport boundary.
//!
//! The protocol core only needs a reliable duplex channel of typed frames plus
//! four lifecycle notifications. Framing and encryption belong to the concrete
//! transport (WebSocket, in-memory loopback).

use crate::error::MmsError;
use crate::protocol::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

pub mod memory;

pub use memory::LoopbackDialer;

/// Lifecycle notifications of one physical connection.
pub trait TransportListener<In, Out> {
    /// The transport has been opened.
    fn on_open(&mut self);

    /// A frame arrived from the peer.
    fn on_message_received(&mut self, message: In);

    /// A frame was handed to the peer.
    fn on_message_sent(&mut self, message: &Out);

    /// The transport closed, locally or remotely.
    fn on_close(&mut self, reason: DisconnectReason);
}

/// Why a physical connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the connection cleanly
    PeerClosed,
    /// I/O error on the underlying transport
    TransportError(String),
    /// Closed on our side (session replaced, evicted or logged out)
    LocalShutdown,
}

/// Client end of a connection: frames to the relay, frames from the relay.
///
/// Dropping the link closes the connection.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Opens physical connections to a relay.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establish a new connection. Failures are reported as `TransportFailure`.
    async fn dial(&self) -> Result<Link, MmsError>;
}

/// Relay-side sending half of one connection.
///
/// Cloned into the relay when a session binds to the connection. `close()`
/// asks the connection task to flush what is queued and shut down.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<ServerMessage>,
    shutdown: Arc<Notify>,
}

impl Outbound {
    /// Queue a frame. Returns `false` when the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half consumed by the connection task.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    shutdown: Arc<Notify>,
    closing: bool,
}

impl OutboundReceiver {
    /// Next frame to write. `None` once shutdown was requested and the queue is drained.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        if self.closing {
            return self.rx.try_recv().ok();
        }
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.shutdown.notified() => {
                self.closing = true;
                self.rx.try_recv().ok()
            }
        }
    }
}

impl OutboundReceiver {
    /// Next queued frame without waiting
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.rx.try_recv().ok()
    }
}

pub fn outbound_channel() -> (Outbound, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());
    (
        Outbound {
            tx,
            shutdown: Arc::clone(&shutdown),
        },
        OutboundReceiver {
            rx,
            shutdown,
            closing: false,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn frame(n: u64) -> ServerMessage {
        ServerMessage::Error {
            code: ErrorCode::Protocol,
            message: n.to_string(),
        }
    }

    #[tokio::test]
    async fn test_close_flushes_queued_frames() {
        let (outbound, mut rx) = outbound_channel();
        assert!(outbound.send(frame(1)));
        assert!(outbound.send(frame(2)));
        outbound.close();

        assert_eq!(rx.recv().await, Some(frame(1)));
        assert_eq!(rx.recv().await, Some(frame(2)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_without_frames() {
        let (outbound, mut rx) = outbound_channel();
        outbound.close();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (outbound, rx) = outbound_channel();
        drop(rx);
        assert!(outbound.is_closed());
        assert!(!outbound.send(frame(1)));
    }
}
