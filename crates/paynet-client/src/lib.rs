//! paynet-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does paynet-client do?
//!
//! A payment terminal (a coin box, a kiosk) keeps one long-lived connection
//! to the paynet gateway.  The client:
//!
//! 1. Opens a mutually authenticated TLS connection to the gateway.
//! 2. Registers the device and logs in (`RegisterReq` → `RegisterRsp`,
//!    `LoginReq` → `LoginRsp`).
//! 3. Routes every inbound frame to the handler registered for its type,
//!    one frame at a time, in arrival order.
//! 4. Sends a `Ping` every heartbeat interval and tears the session down if
//!    the gateway stops answering.
//! 5. Reconnects with exponential backoff after any transient failure.
//!
//! # Example
//!
//! ```no_run
//! use paynet_client::{handler_fn, Client, ClientConfig, LoginFlow};
//! use paynet_core::protocol::paybox::{CoinAck, CoinCommand, CoinState, TYPE_COIN_COMMAND};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), paynet_client::ClientError> {
//! let client = Client::new(ClientConfig::default())?;
//! client.subscribe(
//!     TYPE_COIN_COMMAND,
//!     handler_fn(|ctx, cmd: CoinCommand| async move {
//!         ctx.send(&CoinAck { order_id: cmd.order_id, state: CoinState::Accepted, progress: 0 })
//!             .await?;
//!         Ok(())
//!     }),
//! );
//! client.run(CancellationToken::new(), LoginFlow::default()).await
//! # }
//! ```

/// Domain layer: configuration, states, and errors.
pub mod domain;

/// Application layer: registry, dispatch, handshake, and heartbeat.
pub mod application;

/// Infrastructure layer: TLS connector and the per-connection session.
pub mod infrastructure;

/// The `Client` facade.
pub mod client;

pub use application::dispatcher::{DispatchOutcome, Dispatcher};
pub use application::handler::{handler_fn, Handler, HandlerContext};
pub use application::handshake::LoginFlow;
pub use application::outbox::{FrameWriter, SendOptions};
pub use application::registry::{global, paybox_schema, MessageMeta, Registry, RegistryBuilder};
pub use client::Client;
pub use domain::{
    ClientConfig, ClientError, ClientEvent, ConfigError, RegistryError, RetryPolicy,
    SessionState, Settings, TlsOptions,
};
pub use infrastructure::network::{BoxedTransport, Connector};
