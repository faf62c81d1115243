//! Server side of one physical connection.
//!
//! Translates client frames into relay operations. The first frame must be
//! `hello`; everything else before it is answered with an
//! `unauthenticated_session` error frame. Errors never close the connection.

use crate::error::{MmsError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::relay::{Attachment, BroadcastRelay, CloseReason};
use crate::session::SessionId;
use crate::transport::{DisconnectReason, Outbound, TransportListener};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub struct ServerConnection {
    relay: Arc<BroadcastRelay>,
    outbound: Outbound,
    attachment: Option<Attachment>,
    logged_out: bool,
}

impl ServerConnection {
    pub fn new(relay: Arc<BroadcastRelay>, outbound: Outbound) -> Self {
        Self {
            relay,
            outbound,
            attachment: None,
            logged_out: false,
        }
    }

    /// Session bound by the handshake, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        self.attachment.as_ref().map(|a| &a.session_id)
    }

    fn session(&self) -> Result<SessionId> {
        self.session_id()
            .cloned()
            .ok_or(MmsError::UnauthenticatedSession(None))
    }

    fn handle(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Hello {
                session_id,
                latest_received_id,
            } => {
                if self.attachment.is_some() {
                    return Err(MmsError::Protocol(
                        "hello already received on this connection".to_string(),
                    ));
                }
                // The link is shutting down; a session opened now would never be detached
                if self.logged_out {
                    return Err(MmsError::Protocol(
                        "hello after logout on this connection".to_string(),
                    ));
                }
                let attachment = self.relay.open_session(
                    session_id.as_ref(),
                    latest_received_id,
                    self.outbound.clone(),
                );
                self.attachment = Some(attachment);
            }
            ClientMessage::Subscribe { channel } => {
                let session = self.session()?;
                self.relay.subscribe(&session, &channel)?;
            }
            ClientMessage::Unsubscribe { channel } => {
                let session = self.session()?;
                self.relay.unsubscribe(&session, &channel)?;
            }
            ClientMessage::Publish(envelope) => {
                let session = self.session()?;
                self.relay.publish(&session, envelope)?;
            }
            ClientMessage::Logout => {
                let session = self.session()?;
                self.relay.close_session(&session, CloseReason::Logout);
                self.logged_out = true;
                self.attachment = None;
            }
        }
        Ok(())
    }
}

impl TransportListener<ClientMessage, ServerMessage> for ServerConnection {
    fn on_open(&mut self) {
        self.relay.metrics().transport_opened();
        debug!("Transport opened");
    }

    fn on_message_received(&mut self, message: ClientMessage) {
        if let Err(e) = self.handle(message) {
            warn!(
                session_id = ?self.session_id().map(SessionId::as_str),
                error = %e,
                "Rejected client frame"
            );
            self.outbound.send(ServerMessage::error(&e));
        }
    }

    fn on_message_sent(&mut self, message: &ServerMessage) {
        if let ServerMessage::Relay(envelope) = message {
            trace!(id = envelope.id, channel = %envelope.channel, "Relay frame sent");
        }
    }

    fn on_close(&mut self, reason: DisconnectReason) {
        self.relay.metrics().transport_closed();
        match self.attachment.take() {
            Some(attachment) if !self.logged_out => {
                self.relay.detach(&attachment.session_id, attachment.generation);
                info!(
                    session_id = %attachment.session_id,
                    reason = ?reason,
                    "Connection closed"
                );
            }
            _ => debug!(reason = ?reason, "Connection closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{new_relay_policy, RelayPolicy};
    use crate::error::ErrorCode;
    use crate::protocol::PublishEnvelope;
    use crate::transport::{outbound_channel, OutboundReceiver};
    use std::time::Duration;

    fn setup() -> (Arc<BroadcastRelay>, ServerConnection, OutboundReceiver) {
        let relay = Arc::new(BroadcastRelay::new(
            new_relay_policy(RelayPolicy::default()),
            Duration::from_secs(60),
        ));
        let (outbound, rx) = outbound_channel();
        let mut connection = ServerConnection::new(Arc::clone(&relay), outbound);
        connection.on_open();
        (relay, connection, rx)
    }

    fn hello(session_id: Option<SessionId>, latest_received_id: u64) -> ClientMessage {
        ClientMessage::Hello {
            session_id,
            latest_received_id,
        }
    }

    fn error_code(frame: Option<ServerMessage>) -> Option<ErrorCode> {
        match frame {
            Some(ServerMessage::Error { code, .. }) => Some(code),
            _ => None,
        }
    }

    #[test]
    fn test_frames_before_hello_are_rejected() {
        let (relay, mut connection, mut rx) = setup();

        connection.on_message_received(ClientMessage::Subscribe {
            channel: "ch".to_string(),
        });
        connection.on_message_received(ClientMessage::Publish(PublishEnvelope {
            message_id: 1,
            latest_received_id: 0,
            channel: "ch".to_string(),
            payload: vec![1],
            position_time: None,
        }));

        assert_eq!(error_code(rx.try_recv()), Some(ErrorCode::UnauthenticatedSession));
        assert_eq!(error_code(rx.try_recv()), Some(ErrorCode::UnauthenticatedSession));
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.registry().channel_count(), 0);
    }

    #[test]
    fn test_hello_binds_session() {
        let (relay, mut connection, mut rx) = setup();
        connection.on_message_received(hello(None, 0));

        let session_id = connection.session_id().cloned().unwrap();
        assert!(matches!(rx.try_recv(), Some(ServerMessage::Connected { .. })));

        connection.on_message_received(ClientMessage::Subscribe {
            channel: "ch".to_string(),
        });
        assert_eq!(relay.registry().subscribers_of("ch"), vec![session_id]);
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_duplicate_hello_is_protocol_error() {
        let (relay, mut connection, mut rx) = setup();
        connection.on_message_received(hello(None, 0));
        rx.try_recv();

        connection.on_message_received(hello(None, 0));
        assert_eq!(error_code(rx.try_recv()), Some(ErrorCode::Protocol));
        assert_eq!(relay.session_count(), 1);
    }

    #[test]
    fn test_close_detaches_but_keeps_session() {
        let (relay, mut connection, _rx) = setup();
        connection.on_message_received(hello(None, 0));
        let session_id = connection.session_id().cloned().unwrap();
        assert_eq!(relay.metrics().snapshot().active_transports, 1);

        connection.on_close(DisconnectReason::PeerClosed);

        assert!(relay.contains_session(&session_id));
        assert!(!relay.is_attached(&session_id));
        assert_eq!(relay.metrics().snapshot().active_transports, 0);
    }

    #[test]
    fn test_logout_destroys_session() {
        let (relay, mut connection, _rx) = setup();
        connection.on_message_received(hello(None, 0));
        let session_id = connection.session_id().cloned().unwrap();

        connection.on_message_received(ClientMessage::Logout);
        assert!(!relay.contains_session(&session_id));
        assert!(connection.session_id().is_none());

        connection.on_close(DisconnectReason::LocalShutdown);
        assert_eq!(relay.session_count(), 0);
    }

    #[test]
    fn test_hello_after_logout_is_rejected() {
        let (relay, mut connection, mut rx) = setup();
        connection.on_message_received(hello(None, 0));
        connection.on_message_received(ClientMessage::Logout);
        while rx.try_recv().is_some() {}

        connection.on_message_received(hello(None, 0));

        assert_eq!(error_code(rx.try_recv()), Some(ErrorCode::Protocol));
        assert_eq!(relay.session_count(), 0);
        assert!(connection.session_id().is_none());
    }
}
