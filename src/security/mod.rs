//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming stream (CONNECT or forward):
//!     → auth.rs (credential presence, 407 challenge)
//!     → headers.rs (allow-list request headers, strip response framing)
//!     → Pass to relay
//! ```
//!
//! # Design Decisions
//! - Fail closed: the gate runs before any upstream resource is allocated
//! - No trust in client input: unknown headers are never forwarded

pub mod auth;
pub mod headers;

pub use auth::{authorize, challenge_response, AuthDecision};
pub use headers::{filter_request_headers, strip_response_headers};
