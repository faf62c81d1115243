//! Wire envelopes exchanged between clients and the relay.
//!
//! Frames are JSON, internally tagged by `type`. Payload bytes travel as base64.

use crate::error::{ErrorCode, MmsError};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};


/// Position and time attached to a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTime {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix epoch milliseconds
    pub time: i64,
}

impl PositionTime {
    pub fn new(latitude: f64, longitude: f64, time: i64) -> Self {
        Self {
            latitude,
            longitude,
            time,
        }
    }
}

/// Client → relay: a broadcast publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEnvelope {
    /// Sender's own outgoing sequence number (not a relay id)
    pub message_id: u64,
    /// Sender's cumulative ack of relay ids it has consumed
    pub latest_received_id: u64,
    /// Canonical message type name
    pub channel: String,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_time: Option<PositionTime>,
}

/// Relay → subscriber: one delivery of a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Relay-assigned id, dense and increasing per recipient
    pub id: u64,
    /// Publisher's message id (informational)
    pub message_id: u64,
    /// Publisher's ack at publish time (informational)
    pub latest_received_id: u64,
    pub channel: String,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_time: Option<PositionTime>,
    pub sender_id: SessionId,
}

impl RelayEnvelope {
    /// Build the delivery of `publish` from `sender` carrying relay id `id`.
    pub fn from_publish(id: u64, sender: &SessionId, publish: &PublishEnvelope) -> Self {
        Self {
            id,
            message_id: publish.message_id,
            latest_received_id: publish.latest_received_id,
            channel: publish.channel.clone(),
            payload: publish.payload.clone(),
            position_time: publish.position_time,
            sender_id: sender.clone(),
        }
    }
}

/// Client → relay frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Resume handshake. Always the first frame on a fresh transport.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default)]
        latest_received_id: u64,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Publish(PublishEnvelope),
    Logout,
}

/// Relay → client frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake answer. `redelivered` counts envelopes replayed before this frame.
    Connected {
        session_id: SessionId,
        resumed: bool,
        #[serde(default)]
        redelivered: u64,
    },
    Relay(RelayEnvelope),
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(err: &MmsError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
