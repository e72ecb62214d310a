//! Proxy authentication gate.
//!
//! # Responsibilities
//! - Decide allow/deny from the configured mode and the request headers
//! - Build the 407 challenge shared by the tunnel and forward paths
//!
//! # Design Decisions
//! - Only the presence of `proxy-authorization` is checked; its value is
//!   never validated here
//! - Runs before any outbound connection or body streaming is started

use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Response, StatusCode};

use crate::config::AuthMode;
use crate::proxy::body::{empty, ProxyBody};

/// Outcome of the authentication gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

/// Decide whether a request may proceed.
pub fn authorize(mode: &AuthMode, headers: &HeaderMap) -> AuthDecision {
    if !mode.is_required() || headers.contains_key(PROXY_AUTHORIZATION) {
        AuthDecision::Allow
    } else {
        AuthDecision::Deny
    }
}

/// Build the challenge written to a denied request.
pub fn challenge_response(mode: &AuthMode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;

    if let AuthMode::Challenge(value) = mode {
        // Validation rejects values that are not header-safe.
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers_mut().insert(PROXY_AUTHENTICATE, value);
        }
    }
    response
}
