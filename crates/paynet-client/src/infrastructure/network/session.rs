//! One live connection to the gateway.
//!
//! A [`Session`] owns two tasks:
//!
//! - the **reader** decodes frames in arrival order and forwards them on a
//!   bounded channel;
//! - the **writer** is the only code that writes to the transport.  Callers
//!   queue whole encoded frames and are told when each one has been flushed,
//!   so concurrent senders never interleave bytes.
//!
//! Any read, write, or framing failure cancels the session token.  Closing is
//! idempotent and also happens when the last handle is dropped.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use paynet_core::{Frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::BoxedTransport;
use crate::application::handshake::Inbound;
use crate::application::outbox::FrameWriter;
use crate::domain::config::ClientConfig;
use crate::domain::error::ClientError;

const READ_CHUNK: usize = 8 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type InboundSender = mpsc::Sender<Result<Frame, ClientError>>;

/// Limits applied to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub max_payload: usize,
    pub inbound_queue: usize,
    pub outbound_queue: usize,
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_payload: config.max_payload,
            inbound_queue: config.inbound_queue,
            outbound_queue: config.outbound_queue,
        }
    }
}

struct WriteRequest {
    bytes: Vec<u8>,
    done: oneshot::Sender<Result<(), ClientError>>,
}

pub struct Session {
    id: Uuid,
    cancel: CancellationToken,
    outbound: mpsc::Sender<WriteRequest>,
    max_payload: usize,
}

impl Session {
    /// Starts the reader and writer tasks on `transport`.
    ///
    /// The session token is a child of `parent`, so cancelling `parent` closes
    /// the session.  Returns the session and its inbound frame stream.
    pub fn open(
        transport: BoxedTransport,
        parent: &CancellationToken,
        opts: SessionOptions,
    ) -> (Self, Inbound) {
        let id = Uuid::new_v4();
        let cancel = parent.child_token();
        let (read_half, write_half) = tokio::io::split(transport);
        let (inbound_tx, inbound_rx) = mpsc::channel(opts.inbound_queue.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(opts.outbound_queue.max(1));

        tokio::spawn(read_loop(
            id,
            read_half,
            inbound_tx.clone(),
            cancel.clone(),
            opts.max_payload,
        ));
        tokio::spawn(write_loop(id, write_half, outbound_rx, inbound_tx, cancel.clone()));
        info!(session = %id, "session opened");

        let session = Self {
            id,
            cancel,
            outbound: outbound_tx,
            max_payload: opts.max_payload,
        };
        (session, inbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled once the session is closed, for whatever reason.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops both tasks and releases the transport.  Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(session = %self.id, "closing session");
            self.cancel.cancel();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl FrameWriter for Session {
    async fn write_frame(&self, frame: Frame) -> Result<(), ClientError> {
        let bytes = frame.encode(self.max_payload)?;
        if self.cancel.is_cancelled() {
            return Err(ClientError::ConnectionClosed);
        }

        let (done, ack) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ClientError::ConnectionClosed),
            queued = self.outbound.send(WriteRequest { bytes, done }) => {
                queued.map_err(|_| ClientError::ConnectionClosed)?;
            }
        }
        match ack.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }
}

/// Hands `item` to the consumer unless the session is closing.
async fn forward(
    tx: &InboundSender,
    cancel: &CancellationToken,
    item: Result<Frame, ClientError>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

async fn read_loop(
    id: Uuid,
    mut reader: ReadHalf<BoxedTransport>,
    tx: InboundSender,
    cancel: CancellationToken,
    max_payload: usize,
) {
    let mut decoder = FrameDecoder::new(max_payload);
    let mut buf = vec![0u8; READ_CHUNK];

    let failure = 'read: loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'read None,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => match decoder.finish() {
                Ok(()) => break 'read Some(ClientError::ConnectionClosed),
                Err(e) => break 'read Some(ClientError::Frame(e)),
            },
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => break 'read Some(ClientError::Io(e)),
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    debug!(
                        session = %id,
                        message_type = %frame.message_type,
                        len = frame.payload.len(),
                        "frame received"
                    );
                    if !forward(&tx, &cancel, Ok(frame)).await {
                        break 'read None;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'read Some(ClientError::Frame(e)),
            }
        }
    };

    if let Some(err) = failure {
        match err {
            ClientError::ConnectionClosed => info!(session = %id, "gateway closed the connection"),
            ref other => warn!(session = %id, "read failed: {other}"),
        }
        forward(&tx, &cancel, Err(err)).await;
    }
    cancel.cancel();
    debug!(session = %id, "reader stopped");
}

async fn write_loop(
    id: Uuid,
    mut writer: WriteHalf<BoxedTransport>,
    mut rx: mpsc::Receiver<WriteRequest>,
    errors: InboundSender,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let WriteRequest { bytes, done } = request;
        let write = async {
            match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        let result: io::Result<()> = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = done.send(Err(ClientError::ConnectionClosed));
                break;
            }
            result = write => result,
        };

        match result {
            Ok(()) => {
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                warn!(session = %id, "write failed: {e}");
                let _ = done.send(Err(ClientError::ConnectionClosed));
                let _ = errors.try_send(Err(ClientError::Io(e)));
                cancel.cancel();
                break;
            }
        }
    }

    // Queued requests are dropped here; their senders observe ConnectionClosed.
    drop(rx);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    debug!(session = %id, "writer stopped");
}
