//! Message abstraction shared by the codec, the registry, and handlers.
//!
//! # Payload encoding
//!
//! The byte layout of an individual payload is owned by the schema, not by the
//! frame codec.  Every schema type implements [`Message`], which knows how to
//! turn itself into payload bytes; the reverse direction is [`decode_payload`].
//! Both are implemented here with `bincode` for any `serde` type, so a schema
//! struct only needs `#[derive(Serialize, Deserialize, Debug)]`.
//!
//! # Type erasure
//!
//! The dispatcher moves messages around as `Box<dyn Message>`.  A handler that
//! was registered for a concrete type gets its value back with
//! [`downcast`](trait.Message.html#method.downcast), which is a *checked*
//! conversion: a mismatch is reported as an error instead of being trusted.

use std::any::Any;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while encoding or decoding a message payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The message could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// The payload bytes do not describe a valid instance of the target type.
    #[error("failed to decode payload as {type_name}: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },
}

// ── Message type identifier ───────────────────────────────────────────────────

/// Wire identifier of a message schema.
///
/// Carried in every frame header as a big-endian `u16`.  Identifiers are unique
/// within a registry; the well-known paybox identifiers live in
/// [`crate::protocol::paybox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageType(pub u16);

impl MessageType {
    /// Returns the raw wire value.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

// ── Message trait ─────────────────────────────────────────────────────────────

/// A schema-typed message that can travel inside a frame.
///
/// Implemented automatically for every `serde` type that is `Send + Sync +
/// Debug + 'static`; there is no need to implement it by hand.
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Serializes the message into payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Encode`] if serialization fails.
    fn encode_payload(&self) -> Result<Vec<u8>, PayloadError>;

    /// Name of the concrete Rust type, used in diagnostics.
    fn type_name(&self) -> &'static str;

    /// Borrows the message as [`Any`] for checked downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Converts the boxed message into a boxed [`Any`].
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static,
{
    fn encode_payload(&self) -> Result<Vec<u8>, PayloadError> {
        bincode::serialize(self).map_err(|e| PayloadError::Encode(e.to_string()))
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn Message {
    /// Returns `true` if the boxed value is a `T`.
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Borrows the value as a `T` if that is its concrete type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recovers the concrete value.
    ///
    /// # Errors
    ///
    /// Returns the original box unchanged (as `Any`) when the concrete type is
    /// not `T`.
    pub fn downcast<T: Message>(self: Box<Self>) -> Result<Box<T>, Box<dyn Any + Send + Sync>> {
        self.into_any().downcast::<T>()
    }
}

/// Decodes payload bytes into a concrete schema type.
///
/// # Errors
///
/// Returns [`PayloadError::Decode`] if the bytes are not a valid `T`.
///
/// # Examples
///
/// ```rust
/// use paynet_core::protocol::paybox::CoinCommand;
/// use paynet_core::{decode_payload, Message};
///
/// let cmd = CoinCommand { order_id: 7, amount: 100, coin_count: 1 };
/// let bytes = cmd.encode_payload().unwrap();
/// let back: CoinCommand = decode_payload(&bytes).unwrap();
/// assert_eq!(back, cmd);
/// ```
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, PayloadError> {
    bincode::deserialize(payload).map_err(|e| PayloadError::Decode {
        type_name: std::any::type_name::<T>(),
        reason: e.to_string(),
    })
}
