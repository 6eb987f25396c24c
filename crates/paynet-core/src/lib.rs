//! # paynet-core
//!
//! Shared wire-level building blocks for the paynet gateway protocol.
//!
//! This crate has no dependency on sockets, TLS, or an async runtime.  It is
//! the part of the protocol that both a terminal and a test gateway agree on.
//!
//! # Architecture overview
//!
//! A payment terminal talks to the remote gateway by exchanging *frames*.
//! Each frame carries a small integer type identifier and an opaque payload:
//!
//! - **`protocol::frame`** – How bytes travel over the network.  A frame is a
//!   6-byte header (payload length + type) followed by the payload.  The
//!   [`FrameDecoder`] reassembles frames from a byte stream that may deliver
//!   partial or coalesced reads.
//!
//! - **`protocol::message`** – The [`Message`] trait that every schema type
//!   implements, plus [`MessageType`].  Payload bytes are produced and consumed
//!   only through this trait, so the frame codec never needs to know the shape
//!   of an individual message.
//!
//! - **`protocol::paybox`** – The concrete paybox schema (registration, login,
//!   heartbeat, coin and query messages) together with their well-known type
//!   identifiers.

pub mod protocol;

pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameDecoder, FrameError};
pub use protocol::message::{decode_payload, Message, MessageType, PayloadError};
