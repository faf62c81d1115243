// Broadcast delivery protocol: sessions, sequencing and cumulative acks
pub mod session;
pub mod protocol;
pub mod codec;
pub mod error;

// Relay core
pub mod relay;

// Server side of a connection and the transports that carry it
pub mod connection;
pub mod transport;

// HTTP and WebSocket APIs
pub mod api;

pub mod config;

pub use codec::BroadcastMessage;
pub use error::{MmsError, Result};
pub use session::{Session, SessionId};
