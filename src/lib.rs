//! HTTP/2 CONNECT and forward proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                      CONNECT PROXY                       │
//!   TLS client    │  ┌─────────┐   ┌────────────┐  h2   ┌─────────────────┐  │
//!   ──────────────┼─▶│   net   │──▶│ dispatcher │──────▶│  proxy::route   │  │
//!                 │  │listener │   │   (ALPN)   │       │ tunnel/forward  │──┼──▶ targets
//!                 │  └─────────┘   └─────┬──────┘       └────────▲────────┘  │
//!                 │                      │ http/1.1              │           │
//!                 │                      ▼                       │           │
//!                 │               ┌────────────┐   loopback  ┌───┴───────┐   │
//!                 │               │  fallback  │────────────▶│   plain   │   │
//!                 │               │   bridge   │             │ listener  │   │
//!                 │               └────────────┘             └───────────┘   │
//!                 │                                                          │
//!                 │  session registry · auth gate · config · observability   │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod proxy;
pub mod session;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
pub use session::SessionRegistry;
