//! Error taxonomy of the client engine.
//!
//! Every failure the engine can surface is a [`ClientError`].  Each variant
//! knows the [`Phase`] it belongs to and whether the reconnect path should
//! run ([`ClientError::is_retryable`]).
//!
//! | Variant             | Phase     | Retried? |
//! |---------------------|-----------|----------|
//! | `Config`            | Config    | no       |
//! | `Connect`           | Connect   | yes      |
//! | `Io`, `Frame`       | Session   | yes      |
//! | `ConnectionClosed`  | Session   | yes      |
//! | `HandshakeRejected` | Handshake | no       |
//! | `HeartbeatTimeout`  | Heartbeat | yes      |
//! | `Dispatch`          | Dispatch  | isolated, never ends a session |
//! | `UnregisteredType`  | Dispatch  | isolated, frame dropped |

use std::fmt;
use std::io;
use std::time::Duration;

use paynet_core::{FrameError, MessageType, PayloadError};
use thiserror::Error;

use crate::domain::config::ConfigError;

/// Which field of a registration collided with an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateField {
    Type,
    Name,
}

impl fmt::Display for DuplicateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateField::Type => f.write_str("type"),
            DuplicateField::Name => f.write_str("name"),
        }
    }
}

/// Errors returned by the message registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The type identifier or the name is already taken.
    #[error("duplicate registration of {name} ({message_type}): {field} already registered")]
    DuplicateRegistration {
        message_type: MessageType,
        name: String,
        field: DuplicateField,
    },

    /// No entry for this type identifier.
    #[error("message type {0} is not registered")]
    NotFound(MessageType),

    /// No entry for this name.
    #[error("message name {0:?} is not registered")]
    NameNotFound(String),

    /// No entry whose schema is this Rust type.
    #[error("no message type registered for {0}")]
    SchemaNotRegistered(&'static str),

    /// The process-wide registry no longer accepts registrations.
    #[error("registry is frozen; register messages before the first client is created")]
    Frozen,
}

/// Which part of the engine an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Connect,
    Session,
    Handshake,
    Dispatch,
    Heartbeat,
    Send,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Config => "config",
            Phase::Connect => "connect",
            Phase::Session => "session",
            Phase::Handshake => "handshake",
            Phase::Dispatch => "dispatch",
            Phase::Heartbeat => "heartbeat",
            Phase::Send => "send",
        };
        f.write_str(name)
    }
}

/// The two request/response steps of the device handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Register,
    Login,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStep::Register => f.write_str("register"),
            HandshakeStep::Login => f.write_str("login"),
        }
    }
}

/// Errors surfaced by the client engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad configuration or unreadable credentials. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TCP or TLS connection establishment failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure on an established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or oversized frame on the wire.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Registry lookup or registration failure.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The gateway declined the device, or a handshake step timed out.
    #[error("handshake rejected at {step} step: {reason}")]
    HandshakeRejected { step: HandshakeStep, reason: String },

    /// An inbound frame has no handler or no schema.
    #[error("no handler or schema registered for message type {0}")]
    UnregisteredType(MessageType),

    /// A handler (or work it spawned) returned an error or panicked.
    #[error("handler for {name} ({message_type}) failed: {source}")]
    Dispatch {
        message_type: MessageType,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// No keepalive acknowledgment within the allowed window.
    #[error("no heartbeat acknowledgment for {missed} intervals of {interval:?}")]
    HeartbeatTimeout { missed: u32, interval: Duration },

    /// The session is not ready or has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The retry policy allows no further reconnect attempts.
    #[error("giving up after {attempts} reconnect attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    /// The caller's cancellation token fired while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// `run` was called while another `run` on the same client is active.
    #[error("client is already running")]
    AlreadyRunning,
}

impl ClientError {
    /// The engine phase this kind of error belongs to.
    ///
    /// The phase is fixed per variant, not tracked from where the error
    /// surfaced: a [`ClientError::ConnectionClosed`] seen during the handshake
    /// is still [`Phase::Session`], and [`ClientError::Cancelled`] is always
    /// [`Phase::Send`].
    pub fn phase(&self) -> Phase {
        match self {
            ClientError::Config(_) | ClientError::AlreadyRunning => Phase::Config,
            ClientError::Connect { .. } | ClientError::RetriesExhausted { .. } => Phase::Connect,
            ClientError::Io(_) | ClientError::Frame(_) | ClientError::ConnectionClosed => {
                Phase::Session
            }
            ClientError::HandshakeRejected { .. } => Phase::Handshake,
            ClientError::UnregisteredType(_) | ClientError::Dispatch { .. } => Phase::Dispatch,
            ClientError::HeartbeatTimeout { .. } => Phase::Heartbeat,
            ClientError::Payload(_) | ClientError::Registry(_) | ClientError::Cancelled => {
                Phase::Send
            }
        }
    }

    /// Whether `run` should tear the session down and reconnect.
    ///
    /// Transport-level failures are retried; configuration problems and
    /// handshake rejections end the run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Io(_)
                | ClientError::Frame(_)
                | ClientError::ConnectionClosed
                | ClientError::HeartbeatTimeout { .. }
        )
    }
}
