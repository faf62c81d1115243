use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// What the relay does with a recipient whose backlog crossed its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Discard the recipient's pending queue, keep the session
    DropBacklog,
    /// Close the session and release its delivery record
    Evict,
    /// Record the event and keep buffering
    LogOnly,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_backlog" => Ok(Self::DropBacklog),
            "evict" => Ok(Self::Evict),
            "log_only" => Ok(Self::LogOnly),
            other => Err(format!("unknown backpressure policy '{}'", other)),
        }
    }
}

/// Relay limits that operators may change without restart (PUT /api/admin/relay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPolicy {
    /// Deliver a publish back to its own sender when subscribed
    pub self_delivery: bool,
    /// Maximum unacknowledged envelopes buffered per recipient
    pub max_pending: usize,
    /// Maximum age of the oldest unacknowledged envelope (seconds)
    pub max_pending_age_secs: u64,
    pub backpressure_policy: BackpressurePolicy,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            self_delivery: false,
            max_pending: 10_000,
            max_pending_age_secs: 3_600,
            backpressure_policy: BackpressurePolicy::DropBacklog,
        }
    }
}

impl RelayPolicy {
    /// Apply MMS_* env var overrides; unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("MMS_SELF_DELIVERY") {
            if let Ok(b) = v.parse::<bool>() {
                self.self_delivery = b;
            }
        }
        if let Ok(v) = std::env::var("MMS_MAX_PENDING") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_pending = n;
            }
        }
        if let Ok(v) = std::env::var("MMS_MAX_PENDING_AGE_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.max_pending_age_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MMS_BACKPRESSURE_POLICY") {
            if let Ok(p) = v.parse::<BackpressurePolicy>() {
                self.backpressure_policy = p;
            }
        }
        self
    }
}

pub type SharedRelayPolicy = Arc<RwLock<RelayPolicy>>;

pub fn new_relay_policy(policy: RelayPolicy) -> SharedRelayPolicy {
    Arc::new(RwLock::new(policy))
}
