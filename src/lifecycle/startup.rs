//! Startup orchestration.
//!
//! # Responsibilities
//! - Load the TLS material named by the configuration
//! - Install the metrics exporter when enabled
//! - Bind listeners and hand back a ready server
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners bind last, once everything they depend on is ready

use std::path::Path;

use crate::config::ProxyConfig;
use crate::http::{ProxyServer, ServerError};
use crate::net::{self, ListenerError};
use crate::observability::metrics;

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    #[error(transparent)]
    MetricsAddress(#[from] ListenerError),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Prepare a server for `config`. The caller runs it.
pub async fn start(config: ProxyConfig) -> Result<ProxyServer, StartupError> {
    let tls = net::load_server_config(
        Path::new(&config.tls.cert_path),
        Path::new(&config.tls.key_path),
    )
    .await
    .map_err(StartupError::Tls)?;
    tracing::info!(
        cert_path = %config.tls.cert_path,
        key_path = %config.tls.key_path,
        "TLS material loaded"
    );

    if config.observability.metrics_enabled {
        let addr = net::parse_addr("metrics", &config.observability.metrics_address)?;
        metrics::init_metrics(addr)?;
    }

    Ok(ProxyServer::bind(config, tls).await?)
}
