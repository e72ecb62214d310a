//! TLS configuration and certificate loading.
//!
//! # Design Decisions
//! - PEM parsing goes through `axum-server`'s `RustlsConfig`
//! - ALPN is set per server mode; the multiplexed mode still offers
//!   `http/1.1` so plain-protocol clients finish the handshake and can be
//!   bridged to the plain listener

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Protocols offered during the TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnMode {
    /// Offer `h2`, then `http/1.1`.
    Multiplexed,
    /// Offer `http/1.1` only.
    Http1Only,
}

impl AlpnMode {
    pub fn protocols(&self) -> Vec<Vec<u8>> {
        match self {
            AlpnMode::Multiplexed => vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()],
            AlpnMode::Http1Only => vec![ALPN_HTTP11.to_vec()],
        }
    }
}

/// Load a server configuration from PEM certificate and key files.
pub async fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, io::Error> {
    if !cert_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("certificate file not found: {}", cert_path.display()),
        ));
    }
    if !key_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("private key file not found: {}", key_path.display()),
        ));
    }

    let config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    Ok((*config.get_inner()).clone())
}

/// Replace the ALPN list of `config` for `mode`.
pub fn with_alpn(mut config: ServerConfig, mode: AlpnMode) -> Arc<ServerConfig> {
    config.alpn_protocols = mode.protocols();
    Arc::new(config)
}

/// Build the acceptor for the primary listener.
pub fn acceptor(config: ServerConfig, mode: AlpnMode) -> TlsAcceptor {
    TlsAcceptor::from(with_alpn(config, mode))
}
