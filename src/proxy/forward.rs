//! Forward request relay.
//!
//! # Responsibilities
//! - Resolve the absolute `http://` target of a non-CONNECT stream
//! - Re-issue it over HTTP/1.1 with an allow-listed header subset
//! - Stream the origin's response back, stripped of hop-by-hop headers
//!
//! # Design Decisions
//! - Request and response bodies are streamed, never buffered
//! - `https://` targets are refused; clients must tunnel them
//! - Targets naming one of the proxy's own listeners are refused, since each
//!   hop would forward the same request again
//! - The response body owns the stream guard, so a forward stream is
//!   counted until its last byte is relayed or the client goes away

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use http::uri::{Authority, Scheme};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HOST;
use hyper::{Request, Response, Uri, Version};

use crate::observability::metrics;
use crate::proxy::body::ProxyBody;
use crate::proxy::error::ProxyError;
use crate::proxy::ProxyContext;
use crate::security::{
    authorize, challenge_response, filter_request_headers, strip_response_headers, AuthDecision,
};
use crate::session::{SessionHandle, StreamGuard, StreamKind};

const DEFAULT_HTTP_PORT: u16 = 80;

/// Absolute origin target of a forward request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    uri: Uri,
}

impl ForwardTarget {
    /// Resolve the target from the request URI, falling back to `Host` for
    /// origin-form requests.
    pub fn from_request<B>(request: &Request<B>) -> Result<Self, ProxyError> {
        let uri = request.uri();

        match uri.scheme() {
            None => {}
            Some(scheme) if *scheme == Scheme::HTTP => {}
            Some(scheme) if *scheme == Scheme::HTTPS => {
                return Err(ProxyError::SchemeUnsupported(scheme.to_string()));
            }
            Some(scheme) => {
                return Err(ProxyError::MalformedRequest(format!(
                    "unsupported scheme '{scheme}'"
                )));
            }
        }

        let authority: Authority = match uri.authority() {
            Some(authority) => authority.clone(),
            None => request
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ProxyError::MalformedRequest("request without a host".to_string()))?
                .parse()
                .map_err(|_| ProxyError::MalformedRequest("invalid host header".to_string()))?,
        };

        if authority.host().is_empty() {
            return Err(ProxyError::MalformedRequest("empty host".to_string()));
        }

        let port = authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

        let uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(format!("{}:{}", authority.host(), port))
            .path_and_query(path)
            .build()
            .map_err(|err| ProxyError::MalformedRequest(err.to_string()))?;

        Ok(Self { uri })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Host as it appears in the URI (IPv6 literals keep their brackets).
    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT)
    }

    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    /// Whether the target is the literal address `addr`, or `localhost` on a
    /// loopback `addr`. Names are not resolved.
    pub fn points_at(&self, addr: SocketAddr) -> bool {
        if self.port() != addr.port() {
            return false;
        }
        let host = self.host().trim_start_matches('[').trim_end_matches(']');
        let local = addr.ip();
        let any_local = local.is_unspecified();
        match host.parse::<IpAddr>() {
            Ok(ip) => ip == local || (any_local && (ip.is_loopback() || ip.is_unspecified())),
            Err(_) => host.eq_ignore_ascii_case("localhost") && (local.is_loopback() || any_local),
        }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Build the outbound HTTP/1.1 request. The inbound body is passed through.
pub fn build_outbound<B>(request: Request<B>, target: &ForwardTarget) -> Request<B> {
    let (parts, body) = request.into_parts();

    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = target.uri().clone();
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = filter_request_headers(&parts.headers);
    outbound
}

/// Handle a non-CONNECT stream.
pub async fn handle_forward(
    ctx: Arc<ProxyContext>,
    handle: SessionHandle,
    request: Request<Incoming>,
) -> Response<ProxyBody> {
    let session = handle.id();
    let mode = &ctx.config().authenticate;
    if authorize(mode, request.headers()) == AuthDecision::Deny {
        tracing::info!(session = %session, uri = %request.uri(), "Request requires proxy authentication");
        metrics::record_forward_response(ProxyError::AuthRequired.status().as_u16());
        return challenge_response(mode);
    }

    let target = match ForwardTarget::from_request(&request) {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!(session = %session, uri = %request.uri(), error = %err, "Rejecting request");
            metrics::record_forward_response(err.status().as_u16());
            return err.into_forward_response();
        }
    };

    if let Some(listener) = ctx.listeners().iter().find(|addr| target.points_at(**addr)) {
        let err = ProxyError::MalformedRequest(format!(
            "target {target} is this proxy's listener {listener}"
        ));
        tracing::warn!(session = %session, error = %err, "Rejecting request");
        metrics::record_forward_response(err.status().as_u16());
        return err.into_forward_response();
    }

    let stream = handle.begin_stream(StreamKind::Forward);
    let url = target.url();
    tracing::info!(session = %session, method = %request.method(), url = %url, "Forwarding request");

    let outbound = build_outbound(request, &target);
    match ctx.client().request(outbound).await {
        Ok(upstream) => {
            let (mut parts, body) = upstream.into_parts();
            strip_response_headers(&mut parts.headers);

            tracing::info!(
                session = %session,
                url = %url,
                status = parts.status.as_u16(),
                "Response received"
            );
            metrics::record_forward_response(parts.status.as_u16());

            let body = RelayBody::new(body, stream, Arc::from(url), ctx.config().response_bytes);
            let mut response = Response::new(body.boxed());
            *response.status_mut() = parts.status;
            *response.headers_mut() = parts.headers;
            response
        }
        Err(source) => {
            let err = ProxyError::UpstreamRequest { url, source };
            tracing::warn!(session = %session, error = %err.chain(), "Upstream request failed");
            metrics::record_forward_response(err.status().as_u16());
            err.into_forward_response()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Streaming,
    Complete,
    Aborted,
}

/// Response body relayed from the origin.
///
/// Frames pass through untouched. An upstream error is handed to hyper,
/// which resets the client stream instead of ending it cleanly.
pub struct RelayBody<B> {
    inner: B,
    label: Arc<str>,
    log_chunks: bool,
    bytes: u64,
    state: RelayState,
    stream: StreamGuard,
}

impl<B> RelayBody<B> {
    pub fn new(inner: B, stream: StreamGuard, label: Arc<str>, log_chunks: bool) -> Self {
        Self {
            inner,
            label,
            log_chunks,
            bytes: 0,
            state: RelayState::Streaming,
            stream,
        }
    }

    fn complete(&mut self) {
        if self.state == RelayState::Streaming {
            self.state = RelayState::Complete;
            tracing::info!(
                session = %self.stream.session(),
                url = %self.label,
                bytes = self.bytes,
                duration_ms = self.stream.elapsed().as_millis() as u64,
                "Response end"
            );
        }
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.state != RelayState::Streaming {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(chunk) = frame.data_ref() {
                    this.bytes += chunk.len() as u64;
                    if this.log_chunks {
                        tracing::info!(url = %this.label, bytes = chunk.len(), "Response chunk");
                    }
                }
                if this.inner.is_end_stream() {
                    this.complete();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                this.state = RelayState::Aborted;
                tracing::warn!(
                    session = %this.stream.session(),
                    url = %this.label,
                    bytes = this.bytes,
                    error = %err,
                    "Response aborted"
                );
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.complete();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.state != RelayState::Streaming || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for RelayBody<B> {
    fn drop(&mut self) {
        if self.state == RelayState::Streaming {
            tracing::debug!(
                session = %self.stream.session(),
                url = %self.label,
                bytes = self.bytes,
                "Response dropped before completion"
            );
        }
    }
}
