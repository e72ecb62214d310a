//! Proxy server: listeners, accept loops and TLS.
//!
//! # Responsibilities
//! - Bind the primary listener and, unless `http1_secured`, the plain one
//! - Run one accept loop per listener until shutdown
//! - Complete the TLS handshake and hand off to the dispatcher
//!
//! # Design Decisions
//! - Each connection runs in its own task; a failing connection never
//!   affects another one
//! - Shutdown stops accepting; sessions already open run to completion

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::ProxyConfig;
use crate::http::dispatcher::Dispatcher;
use crate::lifecycle::Shutdown;
use crate::net::{self, AlpnMode, ListenerError};
use crate::proxy::ProxyContext;
use crate::session::SessionRegistry;

/// Fatal server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The proxy with its listeners bound.
pub struct ProxyServer {
    primary: TcpListener,
    primary_addr: SocketAddr,
    plain: Option<(TcpListener, SocketAddr)>,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
    registry: SessionRegistry,
}

impl ProxyServer {
    /// Bind the listeners described by `config`, serving TLS with `tls`.
    pub async fn bind(config: ProxyConfig, tls: ServerConfig) -> Result<Self, ServerError> {
        let listener_config = &config.listener;

        let primary_addr = net::parse_addr("primary", &listener_config.primary_address)?;
        let primary = net::bind(primary_addr, listener_config.backlog)?;
        let primary_addr = primary.local_addr()?;

        let plain = if config.http1_secured {
            None
        } else {
            let addr = net::parse_addr("plain", &listener_config.plain_address)?;
            let listener = net::bind(addr, listener_config.backlog)?;
            let addr = listener.local_addr()?;
            Some((listener, addr))
        };

        let mode = if config.http1_secured {
            AlpnMode::Http1Only
        } else {
            AlpnMode::Multiplexed
        };
        let acceptor = net::acceptor(tls, mode);

        tracing::info!(
            primary_addr = %primary_addr,
            plain_addr = ?plain.as_ref().map(|(_, addr)| *addr),
            alpn = ?mode,
            max_concurrent_streams = config.max_concurrent_streams,
            "Proxy server bound"
        );

        let registry = SessionRegistry::new();
        let plain_addr = plain.as_ref().map(|(_, addr)| *addr);
        let listeners = std::iter::once(primary_addr).chain(plain_addr).collect();
        let ctx = Arc::new(ProxyContext::new(config, registry.clone()).with_listeners(listeners));
        let dispatcher = Arc::new(Dispatcher::new(ctx, plain_addr));

        Ok(Self {
            primary,
            primary_addr,
            plain,
            acceptor,
            dispatcher,
            registry,
        })
    }

    /// Address of the TLS listener.
    pub fn primary_addr(&self) -> SocketAddr {
        self.primary_addr
    }

    /// Address of the loopback plain listener, if bound.
    pub fn plain_addr(&self) -> Option<SocketAddr> {
        self.plain.as_ref().map(|(_, addr)| *addr)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ServerError> {
        let plain_task = self.plain.map(|(listener, addr)| {
            tracing::info!(address = %addr, "Plain listener accepting");
            tokio::spawn(accept_plain(
                listener,
                Arc::clone(&self.dispatcher),
                shutdown.subscribe(),
            ))
        });

        tracing::info!(address = %self.primary_addr, "Primary listener accepting");
        accept_secure(
            self.primary,
            self.acceptor,
            self.dispatcher,
            shutdown.subscribe(),
        )
        .await;

        if let Some(task) = plain_task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Plain accept loop panicked");
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

async fn accept_secure(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Primary listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to accept connection");
                        continue;
                    }
                };
                tracing::debug!(peer_addr = %peer, "Connection accepted");

                let acceptor = acceptor.clone();
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    match acceptor.accept(stream).await {
                        Ok(tls) => dispatcher.dispatch_secure(tls, peer).await,
                        Err(err) => {
                            tracing::warn!(peer_addr = %peer, error = %err, "TLS handshake failed");
                        }
                    }
                });
            }
        }
    }
}

async fn accept_plain(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Plain listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to accept connection");
                        continue;
                    }
                };
                tracing::debug!(peer_addr = %peer, "Plain connection accepted");

                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    dispatcher.serve_plain(stream, peer).await;
                });
            }
        }
    }
}
