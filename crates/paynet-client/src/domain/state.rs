//! Observable lifecycle of a client.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

/// Connection lifecycle as seen through [`Client::watch_state`](crate::Client::watch_state).
///
/// ```text
/// Disconnected ─► Connecting ─► Handshaking ─► Ready
///      ▲              │              │           │
///      └──────────────┴──────────────┴───────────┘  (failure, then backoff)
///
/// any state ─► Closing ─► Closed                    (cancellation or fatal error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications broadcast by [`Client::events`](crate::Client::events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection attempt is starting. `attempt` is 0 for the first one.
    Connecting { attempt: u32 },
    /// Transport established; the handshake is about to run.
    Connected { session_id: Uuid },
    /// Handshake completed; sends are accepted.
    Ready { session_id: Uuid, device_id: String },
    /// The session ended.
    Disconnected { session_id: Uuid, reason: String },
    /// Waiting `delay` before reconnect attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The gateway stopped acknowledging heartbeats.
    HeartbeatTimeout { session_id: Uuid },
}
