//! Cumulative-ack bookkeeping for one (relay, recipient) pair.

use crate::config::RelayPolicy;
use crate::error::BackpressureExceeded;
use crate::protocol::RelayEnvelope;
use crate::session::SessionId;
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Size and age limits of a delivery record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBounds {
    pub max_pending: usize,
    pub max_age: Duration,
}

impl From<&RelayPolicy> for AckBounds {
    fn from(policy: &RelayPolicy) -> Self {
        Self {
            max_pending: policy.max_pending,
            max_age: Duration::from_secs(policy.max_pending_age_secs),
        }
    }
}

/// Result of consuming one `latest_received_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckUpdate {
    /// Envelopes released from the delivery record
    pub pruned: usize,
    /// The value was not above the current ack (reordered or replayed)
    pub stale: bool,
    /// The value exceeded the highest id ever assigned and was clamped
    pub clamped: bool,
}

#[derive(Debug, Clone)]
struct Pending {
    envelope: RelayEnvelope,
    enqueued_at: Instant,
}

/// Delivery record of one recipient: every envelope sent but not yet covered
/// by the recipient's cumulative ack, in ascending id order.
#[derive(Debug)]
pub struct AckTracker {
    session_id: SessionId,
    acked: u64,
    highest_assigned: u64,
    pending: VecDeque<Pending>,
}

impl AckTracker {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            acked: 0,
            highest_assigned: 0,
            pending: VecDeque::new(),
        }
    }

    /// Record an envelope that was just assigned the next id for this recipient.
    pub fn track(&mut self, envelope: RelayEnvelope, now: Instant) {
        debug_assert_eq!(envelope.id, self.highest_assigned + 1, "relay ids must be dense");
        self.highest_assigned = envelope.id;
        self.pending.push_back(Pending {
            envelope,
            enqueued_at: now,
        });
    }

    /// Consume a cumulative ack: everything with `id <= latest_received_id` is delivered.
    ///
    /// Values at or below the current ack are no-ops, so acks may arrive in any order.
    pub fn on_ack_received(&mut self, latest_received_id: u64) -> AckUpdate {
        if latest_received_id <= self.acked {
            return AckUpdate {
                stale: latest_received_id < self.acked,
                ..AckUpdate::default()
            };
        }

        let clamped = latest_received_id > self.highest_assigned;
        self.acked = latest_received_id.min(self.highest_assigned);

        let mut pruned = 0;
        while let Some(front) = self.pending.front() {
            if front.envelope.id > self.acked {
                break;
            }
            self.pending.pop_front();
            pruned += 1;
        }

        AckUpdate {
            pruned,
            stale: false,
            clamped,
        }
    }

    /// Ids that were assigned after the current ack but are no longer buffered
    /// (dropped by backpressure policy). `None` when the record is contiguous.
    pub fn missing_after_ack(&self) -> Option<RangeInclusive<u64>> {
        let next_expected = self.acked + 1;
        let first_available = self
            .pending
            .front()
            .map(|p| p.envelope.id)
            .unwrap_or(self.highest_assigned + 1);
        (first_available > next_expected).then(|| next_expected..=first_available - 1)
    }

    /// Pending envelopes with `id > after`, ascending.
    pub fn pending_after(&self, after: u64) -> impl Iterator<Item = &RelayEnvelope> {
        self.pending
            .iter()
            .map(|p| &p.envelope)
            .filter(move |envelope| envelope.id > after)
    }

    /// Enforce the configured bounds.
    pub fn check_bounds(&self, bounds: AckBounds, now: Instant) -> Result<(), BackpressureExceeded> {
        let oldest_age = self.oldest_age(now);
        if self.pending.len() > bounds.max_pending || oldest_age > bounds.max_age {
            return Err(BackpressureExceeded {
                session_id: self.session_id.clone(),
                pending: self.pending.len(),
                oldest_age,
            });
        }
        Ok(())
    }

    /// Discard the whole backlog. Returns the number of envelopes dropped.
    pub fn drop_backlog(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn oldest_age(&self, now: Instant) -> Duration {
        self.pending
            .front()
            .map(|p| now.saturating_duration_since(p.enqueued_at))
            .unwrap_or_default()
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn highest_assigned(&self) -> u64 {
        self.highest_assigned
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
