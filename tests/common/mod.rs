//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use connect_proxy::config::ProxyConfig;
use connect_proxy::session::SessionEvent;
use connect_proxy::{ProxyServer, SessionRegistry, Shutdown};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http2;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName,
};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::TlsConnector;

/// Bytes the echo server writes after its peer half-closed.
pub const ECHO_TRAILER: &[u8] = b"<eof>";

/// A self-signed certificate for `localhost` and a server config using it.
pub struct TestTls {
    pub server: ServerConfig,
    pub cert: CertificateDer<'static>,
}

pub fn tls_material() -> TestTls {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();
    TestTls { server, cert }
}

/// Defaults with both listeners on ephemeral loopback ports.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.primary_address = "127.0.0.1:0".to_string();
    config.listener.plain_address = "127.0.0.1:0".to_string();
    config
}

/// A running proxy.
pub struct TestProxy {
    pub primary: SocketAddr,
    pub plain: Option<SocketAddr>,
    pub registry: SessionRegistry,
    pub shutdown: Shutdown,
    pub cert: CertificateDer<'static>,
}

impl TestProxy {
    pub fn plain(&self) -> SocketAddr {
        self.plain.expect("plain listener bound")
    }
}

pub async fn spawn_proxy(config: ProxyConfig) -> TestProxy {
    let tls = tls_material();
    let server = ProxyServer::bind(config, tls.server).await.unwrap();

    let primary = server.primary_addr();
    let plain = server.plain_addr();
    let registry = server.registry().clone();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(server_shutdown).await;
    });
    // Let the accept loops subscribe before a test may trigger shutdown.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestProxy {
        primary,
        plain,
        registry,
        shutdown,
        cert: tls.cert,
    }
}

/// Open a TLS connection to `addr`, offering `alpn`.
pub async fn tls_connect(
    addr: SocketAddr,
    cert: &CertificateDer<'static>,
    alpn: &[&[u8]],
) -> std::io::Result<TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.add(cert.clone()).unwrap();

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost").unwrap();
    connector.connect(name, tcp).await
}

pub type H2Sender = http2::SendRequest<Full<Bytes>>;

/// Open an h2 session to the proxy's primary listener.
pub async fn h2_session(proxy: &TestProxy) -> H2Sender {
    let tls = tls_connect(proxy.primary, &proxy.cert, &[b"h2", b"http/1.1"])
        .await
        .unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    sender
}

pub fn empty_body() -> Full<Bytes> {
    Full::new(Bytes::new())
}

pub async fn body_string(body: Incoming) -> String {
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Start an HTTP/1.1 origin that answers every request with a JSON
/// description of what it received.
pub async fn start_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(describe_request))
                    .await;
            });
        }
    });
    addr
}

async fn describe_request(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_default();
    let version = format!("{:?}", request.version());
    let headers: serde_json::Map<String, serde_json::Value> = request
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();
    let body = request.into_body().collect().await.unwrap().to_bytes();

    let description = serde_json::json!({
        "method": method,
        "path": path,
        "version": version,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });

    let mut response = Response::new(Full::new(Bytes::from(description.to_string())));
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    response
        .headers_mut()
        .insert("x-origin", HeaderValue::from_static("test-origin"));
    Ok(response)
}

/// Start a raw TCP origin; each connection is handed to `f`.
pub async fn start_raw_origin<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move { f(socket).await });
        }
    });
    addr
}

/// Start a TCP echo server. When the peer half-closes, it writes
/// [`ECHO_TRAILER`] and closes.
pub async fn start_echo_server() -> SocketAddr {
    start_raw_origin(|socket| async move {
        let (mut reader, mut writer) = socket.into_split();
        if tokio::io::copy(&mut reader, &mut writer).await.is_ok() {
            let _ = writer.write_all(ECHO_TRAILER).await;
        }
        let _ = writer.shutdown().await;
    })
    .await
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Read an HTTP/1.1 response head, one byte at a time so nothing past
/// the blank line is consumed.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Send an HTTP/1.1 CONNECT for `target` and return the response head.
pub async fn http1_connect<S>(stream: &mut S, target: &str, extra_headers: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n{extra_headers}\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    read_head(stream).await
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Next session event, failing the test after five seconds.
pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("session event in time")
        .unwrap()
}
