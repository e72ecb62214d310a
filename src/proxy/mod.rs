//! Per-stream proxy handling.
//!
//! # Data Flow
//! ```text
//! stream (h2 or HTTP/1.1)
//!     → route()
//!         CONNECT → tunnel::handle_connect → dial → splice
//!         other   → forward::handle_forward → HTTP/1.1 client → RelayBody
//! ```
//!
//! # Design Decisions
//! - One `ProxyContext` per server, shared by every session
//! - Handlers never fail: every error becomes a response

pub mod body;
pub mod error;
pub mod forward;
pub mod pipe;
pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::ProxyConfig;
use crate::session::{SessionHandle, SessionRegistry};

pub use body::ProxyBody;
pub use error::ProxyError;

/// Outbound client for forwarded requests.
pub type ForwardClient = Client<HttpConnector, Incoming>;

/// State shared by the handlers of every session.
pub struct ProxyContext {
    config: Arc<ProxyConfig>,
    registry: SessionRegistry,
    client: ForwardClient,
    listeners: Vec<SocketAddr>,
}

impl ProxyContext {
    pub fn new(config: ProxyConfig, registry: SessionRegistry) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            config: Arc::new(config),
            registry,
            client,
            listeners: Vec::new(),
        }
    }

    /// Record the proxy's bound listener addresses.
    pub fn with_listeners(mut self, listeners: Vec<SocketAddr>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn client(&self) -> &ForwardClient {
        &self.client
    }

    /// Bound listener addresses; forwarding to these is refused.
    pub fn listeners(&self) -> &[SocketAddr] {
        &self.listeners
    }

    /// Byte telemetry interval for tunnels, if enabled.
    pub fn tunnel_telemetry(&self) -> Option<Duration> {
        self.config.tunnel_bytes.then(|| {
            Duration::from_millis(self.config.observability.telemetry_interval_ms)
        })
    }
}

/// Route one stream of `session` to the tunnel bridge or the forward relay.
pub async fn route(
    ctx: Arc<ProxyContext>,
    session: SessionHandle,
    request: Request<Incoming>,
) -> Response<ProxyBody> {
    if request.method() == Method::CONNECT {
        tunnel::handle_connect(ctx, session, request).await
    } else {
        forward::handle_forward(ctx, session, request).await
    }
}
