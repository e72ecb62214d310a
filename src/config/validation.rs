//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges and address formats
//! - Detect conflicting listener layouts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use hyper::header::HeaderValue;

use crate::config::schema::{AuthMode, ProxyConfig};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: '{value}' is not a socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("listener.plain_address must be a loopback address, got {0}")]
    PlainListenerNotLoopback(SocketAddr),

    #[error("primary and plain listeners share the address {0}")]
    ListenerConflict(SocketAddr),

    #[error("max_concurrent_streams must be greater than zero")]
    ZeroConcurrentStreams,

    #[error("authenticate challenge string must be a non-empty header value")]
    InvalidChallenge,

    #[error("tls.{0} must not be empty")]
    MissingTlsPath(&'static str),

    #[error("observability.telemetry_interval_ms must be greater than zero")]
    ZeroTelemetryInterval,
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let primary = parse_address(
        "listener.primary_address",
        &config.listener.primary_address,
        &mut errors,
    );

    if !config.http1_secured {
        let plain = parse_address(
            "listener.plain_address",
            &config.listener.plain_address,
            &mut errors,
        );
        if let Some(plain) = plain {
            if !plain.ip().is_loopback() {
                errors.push(ValidationError::PlainListenerNotLoopback(plain));
            }
            if primary == Some(plain) {
                errors.push(ValidationError::ListenerConflict(plain));
            }
        }
    }

    if config.max_concurrent_streams == 0 {
        errors.push(ValidationError::ZeroConcurrentStreams);
    }

    if let AuthMode::Challenge(value) = &config.authenticate {
        if value.is_empty() || HeaderValue::from_str(value).is_err() {
            errors.push(ValidationError::InvalidChallenge);
        }
    }

    if config.tls.cert_path.is_empty() {
        errors.push(ValidationError::MissingTlsPath("cert_path"));
    }
    if config.tls.key_path.is_empty() {
        errors.push(ValidationError::MissingTlsPath("key_path"));
    }

    if config.observability.telemetry_interval_ms == 0 {
        errors.push(ValidationError::ZeroTelemetryInterval);
    }
    if config.observability.metrics_enabled {
        parse_address(
            "observability.metrics_address",
            &config.observability.metrics_address,
            &mut errors,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn parse_address(
    field: &'static str,
    value: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<SocketAddr> {
    match value.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            errors.push(ValidationError::InvalidAddress {
                field,
                value: value.to_string(),
            });
            None
        }
    }
}
