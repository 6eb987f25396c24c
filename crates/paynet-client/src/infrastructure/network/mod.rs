//! Connection establishment and the per-connection session.

pub mod session;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::domain::error::ClientError;

pub use session::{Session, SessionOptions};

/// A bidirectional byte stream a session can run on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to the gateway.
///
/// The production implementation is [`TlsConnector`](super::tls::TlsConnector);
/// tests plug in in-memory pipes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes one connection.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connect`] when the peer cannot be reached or the TLS
    /// handshake fails.
    async fn connect(&self) -> Result<BoxedTransport, ClientError>;

    /// Human-readable peer description for logs and errors.
    fn describe(&self) -> String;
}
