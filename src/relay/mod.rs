// Broadcast relay: subscriptions, per-recipient sequencing, cumulative acks

pub mod ack;
pub mod broadcast;
pub mod events;
pub mod metrics;
pub mod registry;

pub use ack::{AckBounds, AckTracker, AckUpdate};
pub use broadcast::{Attachment, BroadcastRelay, PublishOutcome, SweepReport};
pub use events::{CloseReason, RelayEvent};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use registry::SubscriptionRegistry;
