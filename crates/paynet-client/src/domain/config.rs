//! Client configuration types.
//!
//! [`ClientConfig`] carries every runtime knob of the engine.  It is a plain
//! struct with sensible [`Default`]s; the binary fills it from CLI flags or a
//! [`Settings`](super::settings::Settings) file and hands it to
//! [`Client::new`](crate::Client::new), which calls [`ClientConfig::validate`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use paynet_core::protocol::paybox::Ping;
use paynet_core::protocol::DEFAULT_MAX_PAYLOAD;
use rand::Rng;
use thiserror::Error;

use crate::domain::error::ClientError;

/// Errors raised while building or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No gateway address was configured.
    #[error("gateway address must not be empty")]
    MissingAddress,

    /// A field holds a value the engine cannot work with.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// A credential or settings file could not be read.
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A PEM file contained no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// A PEM file contained no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// The configured server name is not a valid DNS name or IP address.
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    /// rustls refused the assembled client configuration.
    #[error("TLS configuration rejected: {0}")]
    Tls(String),

    /// The settings file is not valid TOML for [`Settings`](super::Settings).
    #[error("failed to parse settings TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── TLS ───────────────────────────────────────────────────────────────────────

/// Paths to the PEM material used for mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Device certificate chain presented to the gateway.
    pub cert_file: PathBuf,
    /// Private key matching `cert_file`.
    pub key_file: PathBuf,
    /// CA bundle used to verify the gateway certificate.
    pub ca_file: PathBuf,
    /// Name the gateway certificate must be valid for.
    pub server_name: String,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("./certs/device.crt"),
            key_file: PathBuf::from("./certs/device.key"),
            ca_file: PathBuf::from("./certs/ca.crt"),
            server_name: "paynet.local".to_string(),
        }
    }
}

// ── Reconnect backoff ─────────────────────────────────────────────────────────

/// Exponential backoff applied between reconnect attempts.
///
/// Attempt numbers start at 1.  The delay before attempt `n` is
/// `initial_backoff * multiplier^(n-1)`, capped at `max_backoff`.  With
/// `jitter` enabled the delay is scaled by a random factor in `[0.5, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Retry forever with the default schedule.
    pub fn forever() -> Self {
        Self::default()
    }

    /// Deterministic delay before `attempt` (no jitter applied).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }

    /// Delay before `attempt`, with jitter when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        base.mul_f64(factor)
    }

    /// Whether another reconnect attempt numbered `attempt` is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

// ── Callbacks ─────────────────────────────────────────────────────────────────

/// Builds the keepalive message sent on each heartbeat tick.
///
/// Always a paybox [`Ping`]: the monitor sends it with the Ping wire type and
/// treats any `Pong` as its acknowledgment.  Gateways with a different
/// keepalive message are not supported.
pub type HeartbeatFactory = Arc<dyn Fn() -> Ping + Send + Sync>;

/// Receives errors that are reported out-of-band (handler failures, dropped
/// frames).  Runs on the dispatch path, so it must not block.
pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// The stock heartbeat: wall-clock milliseconds plus process uptime seconds.
pub fn default_heartbeat_factory() -> HeartbeatFactory {
    let started = Instant::now();
    Arc::new(move || Ping {
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        uptime: started.elapsed().as_secs().min(u64::from(u32::MAX)) as u32,
    })
}

// ── Client configuration ──────────────────────────────────────────────────────

/// All runtime configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientConfig {
    /// Gateway `host:port`.
    pub addr: String,
    pub tls: TlsOptions,

    /// Time between heartbeats once the session is ready.
    pub heartbeat_interval: Duration,
    pub heartbeat_factory: HeartbeatFactory,
    /// Intervals without a Pong before the session is declared dead.
    pub heartbeat_miss_limit: u32,

    /// Wait for each handshake response.
    pub handshake_timeout: Duration,
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,

    /// Largest payload accepted or sent, in bytes.
    pub max_payload: usize,
    /// Frames held back while the handshake is in progress.
    pub pending_limit: usize,
    /// Depth of the reader → dispatcher channel.
    pub inbound_queue: usize,
    /// Depth of the writer queue.
    pub outbound_queue: usize,

    pub on_error: Option<ErrorCallback>,
}

impl Default for ClientConfig {
    /// | Field                | Default             |
    /// |----------------------|---------------------|
    /// | addr                 | `127.0.0.1:9443`    |
    /// | heartbeat_interval   | 60 seconds          |
    /// | heartbeat_miss_limit | 2                   |
    /// | handshake_timeout    | 10 seconds          |
    /// | connect_timeout      | 10 seconds          |
    /// | max_payload          | 1 MiB               |
    /// | pending_limit        | 32                  |
    /// | inbound/outbound     | 256 / 256           |
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9443".to_string(),
            tls: TlsOptions::default(),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_factory: default_heartbeat_factory(),
            heartbeat_miss_limit: 2,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            pending_limit: 32,
            inbound_queue: 256,
            outbound_queue: 256,
            on_error: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("addr", &self.addr)
            .field("tls", &self.tls)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_miss_limit", &self.heartbeat_miss_limit)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry", &self.retry)
            .field("max_payload", &self.max_payload)
            .field("pending_limit", &self.pending_limit)
            .field("inbound_queue", &self.inbound_queue)
            .field("outbound_queue", &self.outbound_queue)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Checks the values the engine relies on.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingAddress`] for an empty address, otherwise
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval", "must be greater than zero"));
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(invalid("heartbeat_miss_limit", "must be at least 1"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(invalid("handshake_timeout", "must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "must be greater than zero"));
        }
        if self.max_payload == 0 || self.max_payload > u32::MAX as usize {
            return Err(invalid("max_payload", "must fit in 1..=u32::MAX"));
        }
        if self.inbound_queue == 0 || self.outbound_queue == 0 {
            return Err(invalid("queue depth", "must be at least 1"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be >= 1.0"));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(invalid("retry.max_backoff", "must not be below initial_backoff"));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
