//! In-process transport wired straight into a [`BroadcastRelay`].
//!
//! Used by tests and embedded setups. `sever()` kills every open link the way
//! a dropped TCP connection would, and `set_offline(true)` makes new dials
//! fail until cleared.

use super::{outbound_channel, DisconnectReason, Dialer, Link, TransportListener};
use crate::connection::ServerConnection;
use crate::error::MmsError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::relay::BroadcastRelay;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub struct LoopbackDialer {
    relay: Arc<BroadcastRelay>,
    offline: AtomicBool,
    dials: AtomicUsize,
    epoch: watch::Sender<u64>,
}

impl LoopbackDialer {
    pub fn new(relay: Arc<BroadcastRelay>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            relay,
            offline: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            epoch,
        }
    }

    /// Drop every link currently open. Frames in flight are lost.
    pub fn sever(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Successful dials so far
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn relay(&self) -> &Arc<BroadcastRelay> {
        &self.relay
    }
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self) -> Result<Link, MmsError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MmsError::TransportFailure("relay unreachable".to_string()));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let severed = self.epoch.subscribe();
        tokio::spawn(serve(Arc::clone(&self.relay), client_rx, server_tx, severed));

        let dial = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(dial = dial, "Loopback link opened");

        Ok(Link {
            outbound: client_tx,
            inbound: server_rx,
        })
    }
}

async fn serve(
    relay: Arc<BroadcastRelay>,
    mut from_client: mpsc::UnboundedReceiver<ClientMessage>,
    to_client: mpsc::UnboundedSender<ServerMessage>,
    mut severed: watch::Receiver<u64>,
) {
    let (outbound, mut outbound_rx) = outbound_channel();
    let mut connection = ServerConnection::new(relay, outbound);
    connection.on_open();

    let reason = loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(message) => {
                    if to_client.send(message.clone()).is_err() {
                        break DisconnectReason::PeerClosed;
                    }
                    connection.on_message_sent(&message);
                }
                None => break DisconnectReason::LocalShutdown,
            },
            message = from_client.recv() => match message {
                Some(message) => connection.on_message_received(message),
                None => break DisconnectReason::PeerClosed,
            },
            _ = severed.changed() => {
                break DisconnectReason::TransportError("link severed".to_string());
            }
        }
    };

    connection.on_close(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{new_relay_policy, RelayPolicy};
    use std::time::Duration;

    fn dialer() -> LoopbackDialer {
        let relay = BroadcastRelay::new(
            new_relay_policy(RelayPolicy::default()),
            Duration::from_secs(60),
        );
        LoopbackDialer::new(Arc::new(relay))
    }

    fn hello() -> ClientMessage {
        ClientMessage::Hello {
            session_id: None,
            latest_received_id: 0,
        }
    }

    #[tokio::test]
    async fn test_dial_and_handshake() {
        let dialer = dialer();
        let mut link = dialer.dial().await.unwrap();
        link.outbound.send(hello()).unwrap();

        match link.inbound.recv().await {
            Some(ServerMessage::Connected { resumed, .. }) => assert!(!resumed),
            other => panic!("expected connected, got {:?}", other),
        }
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(dialer.relay().session_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_dial_fails() {
        let dialer = dialer();
        dialer.set_offline(true);
        assert!(matches!(
            dialer.dial().await,
            Err(MmsError::TransportFailure(_))
        ));
        assert_eq!(dialer.dial_count(), 0);

        dialer.set_offline(false);
        assert!(dialer.dial().await.is_ok());
    }

    #[tokio::test]
    async fn test_sever_closes_link_and_detaches() {
        let dialer = dialer();
        let mut link = dialer.dial().await.unwrap();
        link.outbound.send(hello()).unwrap();

        let session_id = match link.inbound.recv().await {
            Some(ServerMessage::Connected { session_id, .. }) => session_id,
            other => panic!("expected connected, got {:?}", other),
        };
        assert!(dialer.relay().is_attached(&session_id));

        dialer.sever();
        assert_eq!(link.inbound.recv().await, None);

        // The serve task detaches after the link drops
        tokio::time::timeout(Duration::from_secs(1), async {
            while dialer.relay().is_attached(&session_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(dialer.relay().contains_session(&session_id));
    }
}
