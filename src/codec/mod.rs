//! Payload codec boundary.
//!
//! The relay treats payloads as opaque bytes. Typed broadcasts are serde types
//! with a canonical channel name; their field encoding is fixed at compile time
//! by the derives.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed broadcast message.
///
/// ```
/// use mms::codec::BroadcastMessage;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct HelloWorld {
///     message: String,
/// }
///
/// impl BroadcastMessage for HelloWorld {
///     const CHANNEL: &'static str = "dk.dma.HelloWorld";
/// }
/// ```
pub trait BroadcastMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Canonical message type name; used as the broadcast channel.
    const CHANNEL: &'static str;
}

pub fn encode<M: BroadcastMessage>(message: &M) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<M: BroadcastMessage>(bytes: &[u8]) -> Result<M> {
    Ok(serde_json::from_slice(bytes)?)
}
