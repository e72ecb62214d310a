//! Error taxonomy for request handling.
//!
//! Every variant maps to the status the client sees. None of them is fatal
//! to the process; listener errors live in `http::server`.

use std::error::Error as _;
use std::io;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

use crate::proxy::body::{empty, full, ProxyBody};

/// Body returned for forward requests with a secure scheme.
pub const TUNNEL_ONLY_MESSAGE: &str =
    "only tunneling is supported for https:// targets; use CONNECT";

/// Media type of synthesized upstream failure bodies.
pub const EXPLANATION_CONTENT_TYPE: &str = "application/proxy-explanation+json";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy authentication required")]
    AuthRequired,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("host not found: {host}")]
    HostNotFound {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {target}")]
    UpstreamConnect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream request to {url} failed")]
    UpstreamRequest {
        url: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("scheme '{0}' cannot be forwarded")]
    SchemeUnsupported(String),
}

impl ProxyError {
    /// Status code reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::HostNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::UpstreamConnect { .. } | ProxyError::UpstreamRequest { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::SchemeUnsupported(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Display of this error followed by its source chain.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = self.source();
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }

    /// Short label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            ProxyError::AuthRequired => "auth_required",
            ProxyError::MalformedRequest(_) => "malformed",
            ProxyError::HostNotFound { .. } => "not_found",
            ProxyError::UpstreamConnect { .. } | ProxyError::UpstreamRequest { .. } => "failed",
            ProxyError::SchemeUnsupported(_) => "scheme_unsupported",
        }
    }

    /// Response for a tunnel request. Tunnel failures carry no body.
    pub fn into_tunnel_response(self) -> Response<ProxyBody> {
        status_response(self.status(), empty())
    }

    /// Response for a forward request.
    pub fn into_forward_response(self) -> Response<ProxyBody> {
        match &self {
            ProxyError::SchemeUnsupported(_) => {
                let mut response = status_response(self.status(), full(TUNNEL_ONLY_MESSAGE));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                response
            }
            ProxyError::UpstreamRequest { .. } | ProxyError::UpstreamConnect { .. } => {
                let body = serde_json::json!({
                    "title": "request error",
                    "description": self.chain(),
                });
                let mut response = status_response(self.status(), full(body.to_string()));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(EXPLANATION_CONTENT_TYPE),
                );
                response
            }
            _ => status_response(self.status(), full(self.to_string())),
        }
    }
}

pub(crate) fn status_response(status: StatusCode, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
