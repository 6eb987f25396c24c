//! Device registration and login.
//!
//! ```text
//! Start ──RegisterReq──► AwaitRegisterRsp ──LoginReq──► AwaitLoginRsp ──► Ready
//!                              │                             │
//!                              └──── reject / timeout ───────┴──────────► Failed
//! ```
//!
//! While a response is awaited, unrelated frames are held in a bounded queue
//! and handed back with the result so the caller can dispatch them once the
//! session is ready.  A gateway `Ping` is answered on the spot.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use paynet_core::protocol::paybox::{
    LoginReq, LoginRsp, Ping, Pong, RegisterReq, RegisterRsp, TYPE_LOGIN_REQ, TYPE_LOGIN_RSP,
    TYPE_PING, TYPE_PONG, TYPE_REGISTER_REQ, TYPE_REGISTER_RSP,
};
use paynet_core::{decode_payload, Frame, Message, MessageType};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::outbox::FrameWriter;
use crate::domain::error::{ClientError, HandshakeStep};

/// Inbound side of a session as the engine consumes it.
pub type Inbound = mpsc::Receiver<Result<Frame, ClientError>>;

/// Credentials presented on every (re)connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginFlow {
    pub register: RegisterReq,
    pub login: LoginReq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    AwaitRegisterRsp,
    AwaitLoginRsp,
    Ready,
    Failed,
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub register: RegisterRsp,
    pub login: LoginRsp,
    /// Frames that arrived during the handshake, in arrival order.
    pub pending: Vec<Frame>,
}

/// Drives one handshake on one session.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    step_timeout: Duration,
    pending: VecDeque<Frame>,
    pending_limit: usize,
    dropped: usize,
}

impl Handshake {
    pub fn new(step_timeout: Duration, pending_limit: usize) -> Self {
        Self {
            state: HandshakeState::Start,
            step_timeout,
            pending: VecDeque::new(),
            pending_limit,
            dropped: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Frames discarded because the pending queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Runs register then login.
    ///
    /// # Errors
    ///
    /// - [`ClientError::HandshakeRejected`] when the gateway declines a step,
    ///   answers with a malformed response, or does not answer in time.
    /// - [`ClientError::Cancelled`] when `cancel` fires.
    /// - Transport errors from the writer or the inbound channel.
    pub async fn run(
        &mut self,
        flow: &LoginFlow,
        writer: &dyn FrameWriter,
        inbound: &mut Inbound,
        cancel: &CancellationToken,
    ) -> Result<HandshakeOutcome, ClientError> {
        match self.drive(flow, writer, inbound, cancel).await {
            Ok((register, login)) => {
                self.state = HandshakeState::Ready;
                Ok(HandshakeOutcome {
                    register,
                    login,
                    pending: self.pending.drain(..).collect(),
                })
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                self.pending.clear();
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        flow: &LoginFlow,
        writer: &dyn FrameWriter,
        inbound: &mut Inbound,
        cancel: &CancellationToken,
    ) -> Result<(RegisterRsp, LoginRsp), ClientError> {
        write_message(writer, TYPE_REGISTER_REQ, &flow.register).await?;
        self.state = HandshakeState::AwaitRegisterRsp;
        debug!(device_sn = %flow.register.device_sn, "register request sent");

        let register: RegisterRsp = self
            .await_response(HandshakeStep::Register, TYPE_REGISTER_RSP, writer, inbound, cancel)
            .await?;
        if !register.success {
            return Err(rejected(HandshakeStep::Register, register.message));
        }
        info!(device_id = %register.device_id, "device registered");

        write_message(writer, TYPE_LOGIN_REQ, &flow.login).await?;
        self.state = HandshakeState::AwaitLoginRsp;

        let login: LoginRsp = self
            .await_response(HandshakeStep::Login, TYPE_LOGIN_RSP, writer, inbound, cancel)
            .await?;
        if !login.success {
            return Err(rejected(HandshakeStep::Login, login.message));
        }
        info!(server_time = login.server_time, "device logged in");

        Ok((register, login))
    }

    async fn await_response<T: DeserializeOwned>(
        &mut self,
        step: HandshakeStep,
        expected: MessageType,
        writer: &dyn FrameWriter,
        inbound: &mut Inbound,
        cancel: &CancellationToken,
    ) -> Result<T, ClientError> {
        let deadline = tokio::time::sleep(self.step_timeout);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                biased;
                item = inbound.recv() => match item {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e),
                    None => return Err(ClientError::ConnectionClosed),
                },
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = &mut deadline => {
                    return Err(rejected(
                        step,
                        format!("no response within {:?}", self.step_timeout),
                    ));
                }
            };

            if frame.message_type == expected {
                return decode_payload(&frame.payload)
                    .map_err(|e| rejected(step, format!("malformed response: {e}")));
            }
            if frame.message_type == TYPE_PING {
                answer_ping(writer, &frame).await?;
                continue;
            }
            self.hold(frame);
        }
    }

    fn hold(&mut self, frame: Frame) {
        if self.pending_limit == 0 {
            self.dropped += 1;
            warn!(message_type = %frame.message_type, "frame dropped during handshake");
            return;
        }
        if self.pending.len() >= self.pending_limit {
            if let Some(oldest) = self.pending.pop_front() {
                self.dropped += 1;
                warn!(
                    message_type = %oldest.message_type,
                    limit = self.pending_limit,
                    "handshake buffer full; dropping oldest frame"
                );
            }
        }
        self.pending.push_back(frame);
    }
}

fn rejected(step: HandshakeStep, reason: impl Into<String>) -> ClientError {
    ClientError::HandshakeRejected {
        step,
        reason: reason.into(),
    }
}

async fn write_message(
    writer: &dyn FrameWriter,
    message_type: MessageType,
    msg: &dyn Message,
) -> Result<(), ClientError> {
    let payload = msg.encode_payload()?;
    writer.write_frame(Frame::new(message_type, payload)).await
}

async fn answer_ping(writer: &dyn FrameWriter, frame: &Frame) -> Result<(), ClientError> {
    let ping: Ping = match decode_payload(&frame.payload) {
        Ok(ping) => ping,
        Err(e) => {
            warn!("ignoring malformed ping during handshake: {e}");
            return Ok(());
        }
    };
    let pong = Pong {
        timestamp: ping.timestamp,
        server_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    };
    debug!(timestamp = ping.timestamp, "answering ping during handshake");
    write_message(writer, TYPE_PONG, &pong).await
}
