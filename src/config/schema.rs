//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy authentication mode (`false`, `true` or a challenge string).
    pub authenticate: AuthMode,

    /// Emit byte-delta telemetry for tunnels.
    pub tunnel_bytes: bool,

    /// Emit chunk-size telemetry for forwarded response bodies.
    pub response_bytes: bool,

    /// Per-session stream cap advertised by the multiplexed protocol.
    #[serde(alias = "maxConcurrentStreams")]
    pub max_concurrent_streams: u32,

    /// Allow the extended CONNECT protocol on multiplexed sessions.
    #[serde(alias = "enableConnectProtocol")]
    pub enable_connect_protocol: bool,

    /// Serve the plain protocol over TLS on the primary port instead of
    /// the multiplexed protocol. No plain listener is bound in this mode.
    pub http1_secured: bool,

    /// Listener addresses.
    pub listener: ListenerConfig,

    /// Certificate and key locations.
    pub tls: TlsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            authenticate: AuthMode::Disabled,
            tunnel_bytes: false,
            response_bytes: false,
            max_concurrent_streams: 100,
            enable_connect_protocol: false,
            http1_secured: false,
            listener: ListenerConfig::default(),
            tls: TlsConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// How inbound requests are authenticated.
///
/// Deserialized from either a boolean or a string: `false` disables the gate,
/// `true` requires a credential without advertising a scheme, and a string
/// requires a credential and is sent back as the `proxy-authenticate` value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(from = "AuthSetting", into = "AuthSetting")]
pub enum AuthMode {
    /// Every request is allowed.
    #[default]
    Disabled,
    /// A credential header is required; the challenge carries no header.
    Blind,
    /// A credential header is required; the challenge carries this value.
    Challenge(String),
}

impl AuthMode {
    /// Whether requests must carry a credential.
    pub fn is_required(&self) -> bool {
        !matches!(self, AuthMode::Disabled)
    }
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum AuthSetting {
    Flag(bool),
    Challenge(String),
}

impl From<AuthSetting> for AuthMode {
    fn from(setting: AuthSetting) -> Self {
        match setting {
            AuthSetting::Flag(false) => AuthMode::Disabled,
            AuthSetting::Flag(true) => AuthMode::Blind,
            AuthSetting::Challenge(value) => AuthMode::Challenge(value),
        }
    }
}

impl From<AuthMode> for AuthSetting {
    fn from(mode: AuthMode) -> Self {
        match mode {
            AuthMode::Disabled => AuthSetting::Flag(false),
            AuthMode::Blind => AuthSetting::Flag(true),
            AuthMode::Challenge(value) => AuthSetting::Challenge(value),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Primary (secure) listener, bound to all interfaces.
    pub primary_address: String,

    /// Plain-protocol listener. Loopback only; the negotiation fallback
    /// target. Ignored when `http1_secured` is set.
    pub plain_address: String,

    /// Accept backlog for both listeners.
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            primary_address: "0.0.0.0:3000".to_string(),
            plain_address: "127.0.0.1:3001".to_string(),
            backlog: 200,
        }
    }
}

/// TLS configuration for the primary listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "http2-cert.pem".to_string(),
            key_path: "http2-cert.key".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Minimum spacing between two byte-delta telemetry events of one
    /// tunnel direction, in milliseconds.
    pub telemetry_interval_ms: u64,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            telemetry_interval_ms: 1000,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
