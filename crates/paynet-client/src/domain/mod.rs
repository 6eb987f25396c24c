//! Domain layer: configuration values, lifecycle states, and the error
//! taxonomy.
//!
//! Nothing in here performs I/O except [`settings::Settings::load`], which
//! reads a TOML file on request.  Every other type is a plain value that the
//! application and infrastructure layers pass around.

pub mod config;
pub mod error;
pub mod settings;
pub mod state;

pub use config::{
    default_heartbeat_factory, ClientConfig, ConfigError, ErrorCallback, HeartbeatFactory,
    RetryPolicy, TlsOptions,
};
pub use error::{ClientError, DuplicateField, HandshakeStep, Phase, RegistryError};
pub use settings::Settings;
pub use state::{ClientEvent, SessionState};
