//! Protocol dispatcher.
//!
//! # Responsibilities
//! - Route a TLS connection by its negotiated ALPN protocol
//! - Serve multiplexed (h2) and plain (HTTP/1.1) sessions with hyper
//! - Register every served connection as a session
//!
//! # Design Decisions
//! - `h2` is served in-process; any other negotiation result is bridged
//!   to the loopback plain listener so one HTTP/1.1 stack serves both
//!   listeners
//! - In `http1_secured` mode there is no plain listener and HTTP/1.1 is
//!   served directly over TLS
//! - A bridged connection is registered under the real client's address,
//!   looked up by the bridge's loopback address
//! - Each session is a shared handle; streams hold it, so a CONNECT tunnel
//!   keeps its HTTP/1.1 session open after hyper hands off the socket

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use crate::http::fallback::{self, BridgeTable};
use crate::net::tls::ALPN_H2;
use crate::proxy::{self, ProxyContext};
use crate::session::Protocol;

/// Hands accepted connections to the right protocol server.
pub struct Dispatcher {
    ctx: Arc<ProxyContext>,
    plain_addr: Option<SocketAddr>,
    bridges: BridgeTable,
}

impl Dispatcher {
    /// `plain_addr` is the bound plain listener, `None` in `http1_secured` mode.
    pub fn new(ctx: Arc<ProxyContext>, plain_addr: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            plain_addr,
            bridges: BridgeTable::new(),
        }
    }

    /// Dispatch a connection that completed the TLS handshake.
    pub async fn dispatch_secure<IO>(&self, stream: TlsStream<IO>, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(ALPN_H2);
        let http1_secured = self.ctx.config().http1_secured;

        match (negotiated_h2, self.plain_addr) {
            (true, _) if !http1_secured => self.serve_multiplexed(stream, peer).await,
            (true, _) => {
                // Not offered in this mode, so a client claiming it is broken.
                tracing::warn!(peer_addr = %peer, "Unexpected h2 negotiation, closing connection");
            }
            (false, Some(plain_addr)) if !http1_secured => {
                tracing::debug!(peer_addr = %peer, plain_addr = %plain_addr, "Bridging to plain listener");
                if let Err(err) = fallback::bridge(stream, plain_addr, peer, &self.bridges).await {
                    tracing::warn!(peer_addr = %peer, error = %err, "Plain listener unreachable");
                }
            }
            (false, _) => self.serve_plain(stream, peer).await,
        }
    }

    /// Serve an HTTP/2 session on `io`.
    pub async fn serve_multiplexed<IO>(&self, io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Arc::new(self.ctx.registry().open(peer, Protocol::Http2));
        let id = session.id();
        let config = self.ctx.config();

        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder.max_concurrent_streams(config.max_concurrent_streams);
        if config.enable_connect_protocol {
            builder.enable_connect_protocol();
        }

        let ctx = Arc::clone(&self.ctx);
        let service = service_fn(move |request| {
            let ctx = Arc::clone(&ctx);
            let session = Arc::clone(&session);
            async move { Ok::<_, Infallible>(proxy::route(ctx, session, request).await) }
        });
        if let Err(err) = builder.serve_connection(TokioIo::new(io), service).await {
            tracing::warn!(session = %id, error = %err, "Session ended with error");
        }
    }

    /// Serve an HTTP/1.1 session on `io`. CONNECT upgrades are enabled.
    ///
    /// The session stays open after an upgrade until the tunnel ends.
    pub async fn serve_plain<IO>(&self, io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client = match self.bridges.client_of(peer) {
            Some(client) => {
                tracing::debug!(peer_addr = %client, bridge_addr = %peer, "Plain connection is a bridged client");
                client
            }
            None => peer,
        };
        let session = Arc::new(self.ctx.registry().open(client, Protocol::Http1));
        let id = session.id();

        let ctx = Arc::clone(&self.ctx);
        let service = service_fn(move |request| {
            let ctx = Arc::clone(&ctx);
            let session = Arc::clone(&session);
            async move { Ok::<_, Infallible>(proxy::route(ctx, session, request).await) }
        });
        let connection = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        if let Err(err) = connection.await {
            tracing::warn!(session = %id, error = %err, "Session ended with error");
        }
    }
}
