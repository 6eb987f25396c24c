//! TOML settings file for the client.
//!
//! Every field is optional in the file; absent fields take the same values as
//! [`ClientConfig::default`].  Example:
//!
//! ```toml
//! addr = "gateway.example.com:9443"
//! log_level = "debug"
//!
//! [tls]
//! cert_file = "/etc/paynet/device.crt"
//! key_file = "/etc/paynet/device.key"
//! ca_file = "/etc/paynet/ca.crt"
//! server_name = "gateway.example.com"
//!
//! [heartbeat]
//! interval_secs = 30
//! miss_limit = 3
//!
//! [retry]
//! initial_backoff_ms = 250
//! max_backoff_ms = 10000
//! max_attempts = 20
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::config::{ClientConfig, ConfigError, HeartbeatFactory, RetryPolicy, TlsOptions};

/// On-disk representation of the client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub addr: String,
    pub tls: TlsSettings,
    pub heartbeat: HeartbeatSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub max_payload: usize,
    pub pending_limit: usize,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
    pub miss_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_secs: u64,
    pub handshake_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let cfg = ClientConfig::default();
        Self {
            addr: cfg.addr,
            tls: TlsSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            max_payload: cfg.max_payload,
            pending_limit: cfg.pending_limit,
            log_level: "info".to_string(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        let tls = TlsOptions::default();
        Self {
            cert_file: tls.cert_file,
            key_file: tls.key_file,
            ca_file: tls.ca_file,
            server_name: tls.server_name,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            miss_limit: 2,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
            max_attempts: policy.max_attempts,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            handshake_secs: 10,
        }
    }
}

impl Settings {
    /// Reads and parses a settings file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`]
    /// if it is not valid settings TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Converts the file form into a runtime [`ClientConfig`].
    pub fn into_client_config(self, heartbeat_factory: HeartbeatFactory) -> ClientConfig {
        ClientConfig {
            addr: self.addr,
            tls: TlsOptions {
                cert_file: self.tls.cert_file,
                key_file: self.tls.key_file,
                ca_file: self.tls.ca_file,
                server_name: self.tls.server_name,
            },
            heartbeat_interval: Duration::from_secs(self.heartbeat.interval_secs),
            heartbeat_factory,
            heartbeat_miss_limit: self.heartbeat.miss_limit,
            handshake_timeout: Duration::from_secs(self.timeouts.handshake_secs),
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                multiplier: self.retry.multiplier,
                jitter: self.retry.jitter,
                max_attempts: self.retry.max_attempts,
            },
            max_payload: self.max_payload,
            pending_limit: self.pending_limit,
            ..ClientConfig::default()
        }
    }
}
