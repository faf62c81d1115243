// Client side of the MMS broadcast protocol

pub mod backoff;
pub mod config;
pub mod connection;
pub mod ws;

pub use config::{BackoffConfig, ClientConfig, PublishPolicy};
pub use connection::{
    Broadcast, BroadcastHeader, ConnectionManager, ConnectionState, PublishReceipt, SessionStatus,
    TypedBroadcast,
};
pub use ws::WsDialer;
