//! CONNECT tunnel bridge.
//!
//! # Responsibilities
//! - Parse and resolve the target authority
//! - Dial the target and classify failures (404 not found, 502 otherwise)
//! - Splice the client stream and the target socket once upgraded
//! - Keep the session's tunnel counter in step with the tunnel's lifetime
//!
//! # Design Decisions
//! - No default port and no connect timeout
//! - The upgrade is awaited in its own task, which owns the stream guard, so
//!   the counter drops and the duration is logged exactly at teardown
//! - The stream guard holds the session open; an HTTP/1.1 session outlives
//!   its connection future while its tunnel runs

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http::uri::Authority;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{lookup_host, TcpStream};

use crate::observability::metrics;
use crate::proxy::body::{empty, ProxyBody};
use crate::proxy::error::{status_response, ProxyError};
use crate::proxy::pipe::{splice, PipeOptions, Teardown, TeardownCause};
use crate::proxy::ProxyContext;
use crate::security::{authorize, challenge_response, AuthDecision};
use crate::session::{SessionHandle, StreamKind};

/// Destination of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    host: String,
    port: u16,
}

impl TunnelTarget {
    /// Parse a `host:port` authority. IPv6 literals lose their brackets.
    pub fn parse(authority: &str) -> Result<Self, ProxyError> {
        let parsed: Authority = authority
            .parse()
            .map_err(|_| ProxyError::MalformedRequest(format!("invalid authority '{authority}'")))?;

        let port = parsed.port_u16().ok_or_else(|| {
            ProxyError::MalformedRequest(format!("missing port in '{authority}'"))
        })?;

        let host = parsed.host();
        let host = host.strip_prefix('[').unwrap_or(host);
        let host = host.strip_suffix(']').unwrap_or(host);
        if host.is_empty() {
            return Err(ProxyError::MalformedRequest(format!(
                "missing host in '{authority}'"
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Target of a CONNECT request: the request authority, or `Host`.
    pub fn from_request<B>(request: &Request<B>) -> Result<Self, ProxyError> {
        if let Some(authority) = request.uri().authority() {
            return Self::parse(authority.as_str());
        }
        match request.headers().get(HOST).and_then(|v| v.to_str().ok()) {
            Some(host) => Self::parse(host),
            None => Err(ProxyError::MalformedRequest(
                "CONNECT without a target authority".to_string(),
            )),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolve and connect to `target`, trying each resolved address in order.
pub async fn dial(target: &TunnelTarget) -> Result<TcpStream, ProxyError> {
    let addrs: Vec<SocketAddr> = lookup_host((target.host(), target.port()))
        .await
        .map_err(|source| ProxyError::HostNotFound {
            host: target.host().to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ProxyError::HostNotFound {
            host: target.host().to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        });
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::debug!(target_addr = %target, address = %addr, error = %err, "Connect attempt failed");
                last_error = Some(err);
            }
        }
    }

    Err(ProxyError::UpstreamConnect {
        target: target.to_string(),
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address reachable")),
    })
}

/// Handle a CONNECT stream.
pub async fn handle_connect(
    ctx: Arc<ProxyContext>,
    handle: SessionHandle,
    mut request: Request<Incoming>,
) -> Response<ProxyBody> {
    let session = handle.id();
    let mode = &ctx.config().authenticate;
    if authorize(mode, request.headers()) == AuthDecision::Deny {
        tracing::info!(session = %session, uri = %request.uri(), "Tunnel requires proxy authentication");
        metrics::record_tunnel_attempt("auth_required");
        return challenge_response(mode);
    }

    let target = match TunnelTarget::from_request(&request) {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!(session = %session, uri = %request.uri(), error = %err, "Rejecting tunnel");
            metrics::record_tunnel_attempt(err.outcome());
            return err.into_tunnel_response();
        }
    };

    let stream = handle.begin_stream(StreamKind::Tunnel);
    tracing::info!(session = %session, target_addr = %target, "Connecting tunnel");

    let server = match dial(&target).await {
        Ok(server) => server,
        Err(err) => {
            tracing::warn!(
                session = %session,
                target_addr = %target,
                status = err.status().as_u16(),
                error = %err.chain(),
                "Tunnel connect failed"
            );
            metrics::record_tunnel_attempt(err.outcome());
            return err.into_tunnel_response();
        }
    };

    tracing::info!(session = %session, target_addr = %target, "Tunnel connected");
    metrics::record_tunnel_attempt("established");

    let on_upgrade = hyper::upgrade::on(&mut request);
    let options = PipeOptions {
        label: Arc::from(target.to_string()),
        pipe: "tunnel",
        telemetry: ctx.tunnel_telemetry(),
    };

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let teardown = Teardown::new();
                let report = splice(TokioIo::new(upgraded), server, options, &teardown).await;

                if let (TeardownCause::Failed(side), Some(err)) = (&report.cause, &report.error) {
                    tracing::warn!(
                        session = %session,
                        target_addr = %target,
                        side = %side,
                        error = %err,
                        "Tunnel aborted"
                    );
                }
                tracing::info!(
                    session = %session,
                    target_addr = %target,
                    duration_ms = stream.elapsed().as_millis() as u64,
                    client_to_server = report.client_to_server,
                    server_to_client = report.server_to_client,
                    "Tunnel closed"
                );
            }
            Err(err) => {
                // The client stream died before the 200 went out; the
                // server socket is closed by dropping it.
                tracing::warn!(
                    session = %session,
                    target_addr = %target,
                    error = %err,
                    "Tunnel stream closed before upgrade"
                );
            }
        }
        metrics::record_tunnel_closed(stream.elapsed());
        drop(stream);
    });

    status_response(StatusCode::OK, empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_host_and_port() {
        let target = TunnelTarget::parse("example.com:443").unwrap();
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), 443);
        assert_eq!(target.to_string(), "example.com:443");
    }

    #[test]
    fn strips_ipv6_brackets() {
        let target = TunnelTarget::parse("[::1]:8443").unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.port(), 8443);
        assert_eq!(target.to_string(), "[::1]:8443");
    }

    #[test]
    fn missing_port_is_malformed() {
        let err = TunnelTarget::parse("example.com").unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn target_from_connect_request() {
        let request = Request::connect("127.0.0.1:9000").body(()).unwrap();
        let target = TunnelTarget::from_request(&request).unwrap();
        assert_eq!(target.to_string(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn dial_reaches_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = TunnelTarget::parse(&format!("127.0.0.1:{port}")).unwrap();
        let stream = dial(&target).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn dial_ipv6_literal_without_brackets() {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            // Host without IPv6 loopback.
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let target = TunnelTarget::parse(&format!("[::1]:{port}")).unwrap();
        assert!(dial(&target).await.is_ok());
    }

    #[tokio::test]
    async fn refused_connection_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = TunnelTarget::parse(&format!("127.0.0.1:{port}")).unwrap();
        let err = dial(&target).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unresolvable_host_is_not_found() {
        let target = TunnelTarget::parse("no-such-host.invalid:443").unwrap();
        let err = dial(&target).await.unwrap_err();
        assert!(matches!(err, ProxyError::HostNotFound { .. }));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
