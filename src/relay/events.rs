use crate::config::BackpressurePolicy;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client sent `logout`
    Logout,
    /// Backpressure policy evicted the session
    Evicted,
    /// Detached longer than the grace window
    Expired,
    /// Removed through the admin API
    Operator,
}

/// Operator-facing relay events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    SessionOpened {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    SessionResumed {
        session_id: SessionId,
        redelivered: u64,
        timestamp: DateTime<Utc>,
    },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
        timestamp: DateTime<Utc>,
    },
    Backpressure {
        session_id: SessionId,
        pending: usize,
        oldest_age_ms: u64,
        action: BackpressurePolicy,
        timestamp: DateTime<Utc>,
    },
    /// Ids the recipient will never receive (backlog dropped while it was away)
    AckGap {
        session_id: SessionId,
        first_missing: u64,
        last_missing: u64,
        timestamp: DateTime<Utc>,
    },
}
