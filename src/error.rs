use crate::session::SessionId;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the broadcast protocol core.
///
/// `TransportFailure` is normally absorbed by the client's reconnect loop;
/// `BackpressureExceeded` goes to the relay's policy layer, never to a publisher.
#[derive(Debug, Error)]
pub enum MmsError {
    /// Publish attempted without a live (or queue-eligible) session.
    #[error("not connected")]
    NotConnected,

    /// Traffic from a session id the relay does not know (never seen, expired or logged out).
    #[error("unauthenticated session{}", .0.as_ref().map(|id| format!(" '{}'", id)).unwrap_or_default())]
    UnauthenticatedSession(Option<SessionId>),

    /// A recipient's undelivered backlog outgrew the configured bound.
    #[error(transparent)]
    BackpressureExceeded(#[from] BackpressureExceeded),

    /// I/O level disconnect. Always recoverable by reconnecting.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Peer violated the wire protocol (unexpected frame, malformed handshake).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl MmsError {
    /// Stable wire code used in `error` frames.
    pub fn code(&self) -> ErrorCode {
        match self {
            MmsError::NotConnected => ErrorCode::NotConnected,
            MmsError::UnauthenticatedSession(_) => ErrorCode::UnauthenticatedSession,
            MmsError::BackpressureExceeded(_) => ErrorCode::BackpressureExceeded,
            MmsError::TransportFailure(_) => ErrorCode::TransportFailure,
            MmsError::Codec(_) | MmsError::Protocol(_) => ErrorCode::Protocol,
        }
    }
}

/// Wire representation of an error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotConnected,
    UnauthenticatedSession,
    BackpressureExceeded,
    TransportFailure,
    Protocol,
}

/// A recipient's delivery backlog crossed its size or age bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backpressure exceeded for session '{session_id}': {pending} pending, oldest {oldest_age:?}")]
pub struct BackpressureExceeded {
    pub session_id: SessionId,
    pub pending: usize,
    pub oldest_age: Duration,
}

pub type Result<T, E = MmsError> = std::result::Result<T, E>;
