//! Application layer: the protocol engine's use cases.
//!
//! - **`registry`** – the schema table: wire type ↔ Rust type ↔ name, plus
//!   default handlers.
//! - **`handler`** – the `Handler` trait, typed closures, per-client
//!   subscriptions, and the context a handler receives.
//! - **`dispatcher`** – routes each inbound frame to exactly one handler.
//! - **`handshake`** – the register/login state machine.
//! - **`heartbeat`** – keepalive for a ready session.
//! - **`outbox`** – the `FrameWriter` port and typed sending.
//!
//! **Dependency rule**: nothing in here performs socket I/O.  The
//! infrastructure layer implements `FrameWriter` and feeds inbound frames
//! through a channel.

pub mod dispatcher;
pub mod handler;
pub mod handshake;
pub mod heartbeat;
pub mod outbox;
pub mod registry;
