//! The paybox message schema.
//!
//! Every message a paybox terminal exchanges with the gateway, plus the wire
//! identifier each one travels under.  Identifiers are grouped by purpose:
//!
//! | Range         | Purpose                            |
//! |---------------|------------------------------------|
//! | `0x01`–`0x0F` | Session control (handshake, keepalive, errors) |
//! | `0x10`–`0x1F` | Coin acceptance                    |
//! | `0x20`–`0x2F` | Queries                            |

use serde::{Deserialize, Serialize};

use crate::protocol::message::MessageType;

// ── Message type codes ────────────────────────────────────────────────────────

pub const TYPE_REGISTER_REQ: MessageType = MessageType(0x01);
pub const TYPE_REGISTER_RSP: MessageType = MessageType(0x02);
pub const TYPE_LOGIN_REQ: MessageType = MessageType(0x03);
pub const TYPE_LOGIN_RSP: MessageType = MessageType(0x04);
pub const TYPE_PING: MessageType = MessageType(0x05);
pub const TYPE_PONG: MessageType = MessageType(0x06);
pub const TYPE_ERROR: MessageType = MessageType(0x0F);
pub const TYPE_COIN_COMMAND: MessageType = MessageType(0x10);
pub const TYPE_COIN_ACK: MessageType = MessageType(0x11);
pub const TYPE_QUERY_REQ: MessageType = MessageType(0x20);
pub const TYPE_QUERY_RSP: MessageType = MessageType(0x21);

// ── Handshake ─────────────────────────────────────────────────────────────────

/// First handshake step: the terminal announces itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReq {
    /// Serial number printed on the device.
    pub device_sn: String,
    /// Hardware model, e.g. `"paybox-mini"`.
    pub model: String,
    /// Firmware version string.
    pub firmware: String,
    /// Device public key (DER or raw bytes, opaque here).
    pub device_pubkey: Vec<u8>,
}

/// Gateway verdict on a [`RegisterReq`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRsp {
    pub success: bool,
    /// Device identifier assigned by the gateway (empty on rejection).
    pub device_id: String,
    /// Human-readable reason, mainly meaningful on rejection.
    pub message: String,
}

/// Second handshake step: authenticate the registered device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReq {
    pub device_id: String,
    pub token: String,
    /// Client software version.
    pub version: String,
}

/// Gateway verdict on a [`LoginReq`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRsp {
    pub success: bool,
    pub message: String,
    /// Gateway clock in milliseconds since the Unix epoch.
    pub server_time: u64,
}

// ── Keepalive ─────────────────────────────────────────────────────────────────

/// Heartbeat sent by the terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Seconds since the client process started.
    pub uptime: u32,
}

/// Heartbeat acknowledgment from the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Echo of [`Ping::timestamp`].
    pub timestamp: u64,
    pub server_time: u64,
}

/// Error report; either side may send one at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: u32,
    pub message: String,
}

// ── Coin acceptance ───────────────────────────────────────────────────────────

/// Gateway instructs the terminal to accept coins for an order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinCommand {
    pub order_id: u64,
    /// Amount in minor currency units.
    pub amount: u64,
    pub coin_count: u32,
}

/// Progress of a coin order as reported by the terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinState {
    #[default]
    Unknown,
    Accepted,
    Done,
    Failed,
}

/// Terminal acknowledgment for a [`CoinCommand`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinAck {
    pub order_id: u64,
    pub state: CoinState,
    /// Completion percentage, 0–100.
    pub progress: u32,
}

// ── Queries ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryReq {
    pub query_id: u64,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRsp {
    pub query_id: u64,
    pub success: bool,
    pub body: Vec<u8>,
}
