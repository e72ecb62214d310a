//! Negotiation fallback bridge.
//!
//! A TLS client that did not negotiate `h2` is spliced, byte for byte, onto
//! a fresh loopback connection to the plain listener. The plain listener
//! then sees an ordinary HTTP/1.1 client.
//!
//! The bridge binds its loopback socket before connecting and records the
//! real client under that address in a [`BridgeTable`], so the plain
//! listener can register the session with the client's address rather
//! than the bridge's.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};

use crate::proxy::pipe::{splice, PipeOptions, SpliceReport, Teardown};

/// Real client addresses of live bridges, keyed by the bridge's loopback
/// address.
#[derive(Debug, Default)]
pub struct BridgeTable {
    clients: DashMap<SocketAddr, SocketAddr>,
}

impl BridgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client behind a plain connection from `addr`, if `addr` is a bridge.
    pub fn client_of(&self, addr: SocketAddr) -> Option<SocketAddr> {
        self.clients.get(&addr).map(|client| *client)
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Bridge `client` to the plain listener at `plain_addr`.
///
/// If the plain listener cannot be reached the error is returned and
/// `client` is dropped, which closes the connection.
pub async fn bridge<IO>(
    client: IO,
    plain_addr: SocketAddr,
    peer: SocketAddr,
    table: &BridgeTable,
) -> io::Result<SpliceReport>
where
    IO: AsyncRead + AsyncWrite,
{
    let socket = match plain_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(plain_addr.ip(), 0))?;
    let bridge_addr = socket.local_addr()?;

    // Registered before connecting: the plain listener may accept first.
    table.clients.insert(bridge_addr, peer);
    let result = relay(client, socket, plain_addr, peer, bridge_addr).await;
    table.clients.remove(&bridge_addr);
    result
}

async fn relay<IO>(
    client: IO,
    socket: TcpSocket,
    plain_addr: SocketAddr,
    peer: SocketAddr,
    bridge_addr: SocketAddr,
) -> io::Result<SpliceReport>
where
    IO: AsyncRead + AsyncWrite,
{
    let server: TcpStream = socket.connect(plain_addr).await?;
    server.set_nodelay(true)?;
    tracing::debug!(peer_addr = %peer, bridge_addr = %bridge_addr, "Bridged to plain listener");

    let options = PipeOptions {
        label: Arc::from(peer.to_string()),
        pipe: "fallback",
        telemetry: None,
    };
    let teardown = Teardown::new();
    let report = splice(client, server, options, &teardown).await;

    tracing::debug!(
        peer_addr = %peer,
        bridge_addr = %bridge_addr,
        client_to_server = report.client_to_server,
        server_to_client = report.server_to_client,
        "Fallback bridge closed"
    );
    Ok(report)
}
