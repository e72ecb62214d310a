//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind with backlog)
//!     → tls.rs (handshake, ALPN selection)
//!     → hand off to the dispatcher
//! ```
//!
//! # Design Decisions
//! - The plain listener is loopback only and never sees TLS
//! - ALPN decides the protocol; nothing is sniffed from the byte stream

pub mod listener;
pub mod tls;

pub use listener::{bind, parse_addr, ListenerError};
pub use tls::{acceptor, load_server_config, with_alpn, AlpnMode};
