//! Mutual-TLS connector.
//!
//! Credentials are read once, when the connector is built, so a bad path or an
//! empty PEM file is a configuration error at startup rather than a connect
//! failure on every retry.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::network::{BoxedTransport, Connector};
use crate::domain::config::{ClientConfig, ConfigError, TlsOptions};
use crate::domain::error::ClientError;

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads every certificate in a PEM file.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::NoCertificates`]
/// if it holds none.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ConfigError::NoPrivateKey(path.to_path_buf()))
}

/// Builds the rustls client configuration: gateway verified against the CA
/// bundle, device authenticated with its certificate and key.
pub fn build_client_config(tls: &TlsOptions) -> Result<rustls::ClientConfig, ConfigError> {
    let mut roots = RootCertStore::empty();
    for ca in load_certs(&tls.ca_file)? {
        roots
            .add(ca)
            .map_err(|e| ConfigError::Tls(format!("bad CA certificate: {e}")))?;
    }
    let chain = load_certs(&tls.cert_file)?;
    let key = load_private_key(&tls.key_file)?;

    rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ConfigError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_client_auth_cert(chain, key)
    .map_err(|e| ConfigError::Tls(e.to_string()))
}

/// Validates the name the gateway certificate must match.
pub fn server_name(name: &str) -> Result<ServerName<'static>, ConfigError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| ConfigError::InvalidServerName(name.to_string()))
}

/// TCP + rustls connector for the production gateway.
pub struct TlsConnector {
    addr: String,
    server_name: ServerName<'static>,
    connector: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Loads credentials named in `config` and prepares the connector.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from reading the PEM files or assembling the
    /// rustls configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let server_name = server_name(&config.tls.server_name)?;
        let tls = build_client_config(&config.tls)?;
        debug!(
            cert = %config.tls.cert_file.display(),
            ca = %config.tls.ca_file.display(),
            "TLS credentials loaded"
        );
        Ok(Self {
            addr: config.addr.clone(),
            server_name,
            connector: tokio_rustls::TlsConnector::from(Arc::new(tls)),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedTransport, ClientError> {
        let connect_error = |source: io::Error| ClientError::Connect {
            addr: self.addr.clone(),
            source,
        };

        let tcp = TcpStream::connect(&self.addr).await.map_err(connect_error)?;
        tcp.set_nodelay(true).map_err(connect_error)?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(connect_error)?;

        info!(addr = %self.addr, "TLS session established");
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tls://{}", self.addr)
    }
}
