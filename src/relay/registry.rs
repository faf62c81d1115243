use crate::session::SessionId;
use dashmap::DashMap;
use std::collections::HashSet;

/// Channel → subscribed sessions.
///
/// Sharded per channel so concurrent publishes on different channels do not
/// contend. A reverse index keeps per-session cleanup cheap.
pub struct SubscriptionRegistry {
    channels: DashMap<String, HashSet<SessionId>>,
    by_session: DashMap<SessionId, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// Returns `true` if the subscription is new.
    pub fn subscribe(&self, session: &SessionId, channel: &str) -> bool {
        let added = self
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(session.clone());
        self.by_session
            .entry(session.clone())
            .or_default()
            .insert(channel.to_string());
        added
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, session: &SessionId, channel: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut subscribers) => subscribers.remove(session),
            None => false,
        };
        self.channels
            .remove_if(channel, |_, subscribers| subscribers.is_empty());

        if let Some(mut channels) = self.by_session.get_mut(session) {
            channels.remove(channel);
        }
        self.by_session
            .remove_if(session, |_, channels| channels.is_empty());

        removed
    }

    /// Snapshot of the sessions subscribed to `channel` at the time of the call.
    ///
    /// Unknown channels yield an empty set.
    pub fn subscribers_of(&self, channel: &str) -> Vec<SessionId> {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, session: &SessionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .by_session
            .get(session)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Drop every subscription held by `session`. Returns how many were removed.
    pub fn remove_session(&self, session: &SessionId) -> usize {
        let Some((_, channels)) = self.by_session.remove(session) else {
            return 0;
        };
        for channel in &channels {
            if let Some(mut subscribers) = self.channels.get_mut(channel) {
                subscribers.remove(session);
            }
            self.channels
                .remove_if(channel, |_, subscribers| subscribers.is_empty());
        }
        channels.len()
    }

    /// Number of channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
