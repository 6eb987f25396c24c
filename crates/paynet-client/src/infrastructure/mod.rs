//! Infrastructure layer: sockets, TLS, and the per-connection session.
//!
//! **Dependency rule**: this layer may depend on `application` and `domain`,
//! but MUST NOT be imported by them.  The application layer reaches the wire
//! only through the `FrameWriter` port implemented by `network::Session`.
//!
//! # Sub-modules
//!
//! - **`network`** – the `Connector` seam, the boxed transport type, and the
//!   `Session` that owns one connection's reader and writer tasks.
//! - **`tls`** – PEM loading and the production TCP + rustls connector.

pub mod network;
pub mod tls;
