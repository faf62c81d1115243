use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for everything the relay does to a message.
///
/// Every path that discards or reorders traffic bumps one of these, so loss is
/// always observable.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    publishes_accepted: AtomicU64,
    publishes_rejected: AtomicU64,
    delivered_live: AtomicU64,
    buffered_offline: AtomicU64,
    redelivered: AtomicU64,
    pruned_by_ack: AtomicU64,
    dropped_by_policy: AtomicU64,
    backpressure_events: AtomicU64,
    sender_sequence_gaps: AtomicU64,
    ack_gaps: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_resumed: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_expired: AtomicU64,
    active_transports: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub publishes_accepted: u64,
    pub publishes_rejected: u64,
    pub delivered_live: u64,
    pub buffered_offline: u64,
    pub redelivered: u64,
    pub pruned_by_ack: u64,
    pub dropped_by_policy: u64,
    pub backpressure_events: u64,
    pub sender_sequence_gaps: u64,
    pub ack_gaps: u64,
    pub sessions_opened: u64,
    pub sessions_resumed: u64,
    pub sessions_closed: u64,
    pub sessions_expired: u64,
    pub active_transports: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    if n > 0 {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish_accepted(&self) {
        bump(&self.publishes_accepted, 1);
    }

    pub fn record_publish_rejected(&self) {
        bump(&self.publishes_rejected, 1);
    }

    pub fn record_delivered_live(&self) {
        bump(&self.delivered_live, 1);
    }

    pub fn record_buffered_offline(&self) {
        bump(&self.buffered_offline, 1);
    }

    pub fn record_redelivered(&self, n: u64) {
        bump(&self.redelivered, n);
    }

    pub fn record_pruned(&self, n: u64) {
        bump(&self.pruned_by_ack, n);
    }

    pub fn record_dropped(&self, n: u64) {
        bump(&self.dropped_by_policy, n);
    }

    pub fn record_backpressure(&self) {
        bump(&self.backpressure_events, 1);
    }

    pub fn record_sender_gap(&self) {
        bump(&self.sender_sequence_gaps, 1);
    }

    pub fn record_ack_gap(&self) {
        bump(&self.ack_gaps, 1);
    }

    pub fn record_session_opened(&self) {
        bump(&self.sessions_opened, 1);
    }

    pub fn record_session_resumed(&self) {
        bump(&self.sessions_resumed, 1);
    }

    pub fn record_session_closed(&self) {
        bump(&self.sessions_closed, 1);
    }

    pub fn record_session_expired(&self) {
        bump(&self.sessions_expired, 1);
    }

    pub fn transport_opened(&self) {
        self.active_transports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_closed(&self) {
        // Saturate at zero
        let _ = self
            .active_transports
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            publishes_accepted: load(&self.publishes_accepted),
            publishes_rejected: load(&self.publishes_rejected),
            delivered_live: load(&self.delivered_live),
            buffered_offline: load(&self.buffered_offline),
            redelivered: load(&self.redelivered),
            pruned_by_ack: load(&self.pruned_by_ack),
            dropped_by_policy: load(&self.dropped_by_policy),
            backpressure_events: load(&self.backpressure_events),
            sender_sequence_gaps: load(&self.sender_sequence_gaps),
            ack_gaps: load(&self.ack_gaps),
            sessions_opened: load(&self.sessions_opened),
            sessions_resumed: load(&self.sessions_resumed),
            sessions_closed: load(&self.sessions_closed),
            sessions_expired: load(&self.sessions_expired),
            active_transports: load(&self.active_transports),
        }
    }
}
