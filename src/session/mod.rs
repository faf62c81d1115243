use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;


/// Opaque, stable session identifier. Survives physical reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Sequence state of one endpoint of a session.
///
/// Both sides keep one. On a client, `outgoing_seq` numbers its publishes and
/// `highest_seen` is the high-water mark of relay ids it has received. On the
/// relay, `outgoing_seq` is the relay-id counter for that recipient and
/// `highest_seen` tracks the client's publish ids.
///
/// Mutation goes through `&mut self` only, so the owning task (or the lock
/// guarding it) is the single writer.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    outgoing_seq: u64,
    highest_seen: u64,
    subscriptions: BTreeSet<String>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            outgoing_seq: 0,
            highest_seen: 0,
            subscriptions: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Advance the outgoing counter and return the new value. First call yields 1.
    pub fn next_outgoing_id(&mut self) -> u64 {
        self.outgoing_seq += 1;
        self.outgoing_seq
    }

    /// Last id handed out by [`Session::next_outgoing_id`] (0 if none).
    pub fn outgoing_seq(&self) -> u64 {
        self.outgoing_seq
    }

    /// Raise the high-water mark to `id`.
    ///
    /// Returns `true` if the mark moved. Duplicate or older ids leave it untouched.
    pub fn observe_incoming(&mut self, id: u64) -> bool {
        if id > self.highest_seen {
            self.highest_seen = id;
            true
        } else {
            false
        }
    }

    /// Cumulative ack to piggyback on the next outbound envelope.
    pub fn current_ack(&self) -> u64 {
        self.highest_seen
    }

    /// Returns `true` if the channel was newly added.
    pub fn subscribe(&mut self, channel: &str) -> bool {
        self.subscriptions.insert(channel.to_string())
    }

    /// Returns `true` if the channel was present.
    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        self.subscriptions.remove(channel)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// A fresh session under `id` with zeroed counters and the same subscriptions.
    ///
    /// Used when the relay did not recognise the previous id.
    pub fn renewed(&self, id: SessionId) -> Session {
        Session {
            id,
            outgoing_seq: 0,
            highest_seen: 0,
            subscriptions: self.subscriptions.clone(),
        }
    }
}
