//! Shared fixtures for the client integration tests.
//!
//! - [`DuplexConnector`] hands the client one end of an in-memory pipe per
//!   connection attempt and passes the other end to the test as a
//!   [`Gateway`].
//! - [`Gateway`] is a scripted fake gateway: it reads and writes whole
//!   frames and can run the standard register/login exchange.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paynet_client::application::handshake::LoginFlow;
use paynet_client::{
    paybox_schema, BoxedTransport, Client, ClientConfig, ClientError, Connector, Registry,
    RetryPolicy,
};
use paynet_core::protocol::paybox::{
    LoginReq, LoginRsp, RegisterReq, RegisterRsp, TYPE_LOGIN_REQ, TYPE_LOGIN_RSP,
    TYPE_REGISTER_REQ, TYPE_REGISTER_RSP,
};
use paynet_core::protocol::DEFAULT_MAX_PAYLOAD;
use paynet_core::{decode_payload, Frame, FrameDecoder, Message, MessageType};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

/// In-memory connector; every `connect` produces a fresh pipe.
pub struct DuplexConnector {
    accepted: mpsc::UnboundedSender<Gateway>,
    connects: AtomicUsize,
}

impl DuplexConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Gateway>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            connects: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Number of connections opened so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<BoxedTransport, ClientError> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.accepted
            .send(Gateway::new(server))
            .map_err(|_| ClientError::Connect {
                addr: self.describe(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            })?;
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}

/// Gateway side of one connection.
pub struct Gateway {
    stream: DuplexStream,
    decoder: FrameDecoder,
}

impl Gateway {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(DEFAULT_MAX_PAYLOAD),
        }
    }

    /// Next whole frame from the client, or `None` once the client hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().expect("client sent a bad frame") {
                return Some(frame);
            }
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.decoder.extend(&buf[..n]),
            }
        }
    }

    /// Reads the next frame, asserts its type, and decodes it.
    pub async fn expect<M: DeserializeOwned>(&mut self, message_type: MessageType) -> M {
        let frame = self.next_frame().await.expect("connection closed early");
        assert_eq!(frame.message_type, message_type, "unexpected frame type");
        decode_payload(&frame.payload).expect("undecodable payload")
    }

    pub async fn send(&mut self, message_type: MessageType, msg: &dyn Message) {
        let payload = msg.encode_payload().expect("encode payload");
        self.send_frame(Frame::new(message_type, payload)).await;
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        let bytes = frame.encode(DEFAULT_MAX_PAYLOAD).expect("encode frame");
        self.stream.write_all(&bytes).await.expect("write to client");
    }

    /// Runs register + login, accepting both with `device_id`.
    pub async fn accept_handshake(&mut self, device_id: &str) -> (RegisterReq, LoginReq) {
        let register: RegisterReq = self.expect(TYPE_REGISTER_REQ).await;
        self.send(
            TYPE_REGISTER_RSP,
            &RegisterRsp {
                success: true,
                device_id: device_id.to_string(),
                message: "registered".to_string(),
            },
        )
        .await;
        let login: LoginReq = self.expect(TYPE_LOGIN_REQ).await;
        self.send(
            TYPE_LOGIN_RSP,
            &LoginRsp {
                success: true,
                message: "welcome".to_string(),
                server_time: 1_700_000_000_000,
            },
        )
        .await;
        (register, login)
    }

    /// Drains frames until the client closes the connection.  Returns the
    /// number of frames read on the way.
    pub async fn drain_until_closed(&mut self) -> usize {
        let mut frames = 0;
        while self.next_frame().await.is_some() {
            frames += 1;
        }
        frames
    }
}

pub fn paybox_registry() -> Arc<Registry> {
    let mut builder = Registry::builder();
    for meta in paybox_schema() {
        builder.register(meta).expect("paybox schema registers cleanly");
    }
    Arc::new(builder.build())
}

/// Configuration with fast, deterministic reconnects.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        handshake_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: false,
            max_attempts: None,
        },
        ..ClientConfig::default()
    }
}

pub fn flow(device_sn: &str, device_id: &str, token: &str) -> LoginFlow {
    LoginFlow {
        register: RegisterReq {
            device_sn: device_sn.to_string(),
            model: "paybox-mini".to_string(),
            firmware: "1.0.0".to_string(),
            device_pubkey: b"fake".to_vec(),
        },
        login: LoginReq {
            device_id: device_id.to_string(),
            token: token.to_string(),
            version: "1.0.0".to_string(),
        },
    }
}

/// A client over a fresh [`DuplexConnector`] with the paybox schema.
pub fn client(config: ClientConfig) -> (Client, Arc<DuplexConnector>, mpsc::UnboundedReceiver<Gateway>) {
    let (connector, gateways) = DuplexConnector::new();
    let client = Client::with_connector(config, paybox_registry(), connector.clone())
        .expect("valid test configuration");
    (client, connector, gateways)
}
