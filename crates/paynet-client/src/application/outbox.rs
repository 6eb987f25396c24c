//! Outbound path: the [`FrameWriter`] port and the typed [`Outbox`] on top.
//!
//! The application layer never touches a socket.  It writes whole frames
//! through a [`FrameWriter`], which the infrastructure layer implements with a
//! session's single-writer queue.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paynet_core::{Frame, Message, MessageType};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::registry::Registry;
use crate::domain::error::ClientError;

/// Port through which complete frames reach the wire.
///
/// Implementations must write each frame as one unit: concurrent callers
/// never observe interleaved bytes.
#[async_trait]
pub trait FrameWriter: Send + Sync {
    /// Writes `frame` and resolves once it has been handed to the transport.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] if the connection is gone, or
    /// [`ClientError::Frame`] if the payload exceeds the size limit.
    async fn write_frame(&self, frame: Frame) -> Result<(), ClientError>;
}

/// Per-call options for [`Outbox::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Wire type to use instead of the one registered for the Rust type.
    pub message_type: Option<MessageType>,
    /// Upper bound on waiting for the write.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Typed sender bound to one session.
#[derive(Clone)]
pub struct Outbox {
    registry: Arc<Registry>,
    writer: Arc<dyn FrameWriter>,
}

impl Outbox {
    pub fn new(registry: Arc<Registry>, writer: Arc<dyn FrameWriter>) -> Self {
        Self { registry, writer }
    }

    /// Encodes `msg` and waits until its frame is written.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Registry`] when no wire type is given and none is
    ///   registered for the message's Rust type.
    /// - [`ClientError::Payload`] when encoding fails.
    /// - [`ClientError::Cancelled`] when `cancel` fires first.
    /// - [`ClientError::Io`] with [`io::ErrorKind::TimedOut`] when
    ///   `opts.timeout` elapses.
    /// - Whatever the [`FrameWriter`] reports.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        msg: &dyn Message,
        opts: SendOptions,
    ) -> Result<(), ClientError> {
        let message_type = match opts.message_type {
            Some(message_type) => message_type,
            None => self.registry.type_of_message(msg)?,
        };
        let payload = msg.encode_payload()?;
        debug!(%message_type, len = payload.len(), "sending {}", msg.type_name());

        let write = self.writer.write_frame(Frame::new(message_type, payload));
        let bounded = async {
            match opts.timeout {
                Some(limit) => match tokio::time::timeout(limit, write).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("send of {message_type} timed out after {limit:?}"),
                    ))),
                },
                None => write.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = bounded => result,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
