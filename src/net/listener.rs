//! TCP listener setup.
//!
//! # Responsibilities
//! - Parse configured listener addresses
//! - Bind with the configured accept backlog
//!
//! # Design Decisions
//! - Sockets are built with `TcpSocket` so the backlog is ours, not the OS default
//! - `SO_REUSEADDR` is set so restarts do not trip over `TIME_WAIT`

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket};

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid {field} address '{value}'")]
    Address { field: &'static str, value: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Parse a configured `ip:port` address.
pub fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, ListenerError> {
    value.parse().map_err(|_| ListenerError::Address {
        field,
        value: value.to_string(),
    })
}

/// Bind a listener on `addr` with an accept queue of `backlog`.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ListenerError> {
    let bind_err = |source| ListenerError::Bind { addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    let listener = socket.listen(backlog).map_err(bind_err)?;

    tracing::info!(
        address = %listener.local_addr().unwrap_or(addr),
        backlog,
        "Listener bound"
    );
    Ok(listener)
}
