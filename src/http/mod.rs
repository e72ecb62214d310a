//! Protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! primary listener (TLS)
//!     → server.rs (accept, handshake)
//!     → dispatcher.rs (ALPN)
//!         h2    → serve_multiplexed → proxy::route per stream
//!         other → fallback.rs → loopback → plain listener
//! plain listener (loopback)
//!     → dispatcher.rs serve_plain → proxy::route per request
//! ```

pub mod dispatcher;
pub mod fallback;
pub mod server;

pub use dispatcher::Dispatcher;
pub use server::{ProxyServer, ServerError};
