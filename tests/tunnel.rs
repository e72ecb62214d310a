//! CONNECT tunnel tests over both protocols.

use std::time::Duration;

use connect_proxy::config::AuthMode;
use connect_proxy::session::SessionEvent;
use hyper::header::{PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

mod common;

use common::{
    closed_port, empty_body, h2_session, http1_connect, next_event, spawn_proxy,
    start_echo_server, start_raw_origin, test_config, wait_until, ECHO_TRAILER,
};

fn connect_request(target: &str) -> Request<http_body_util::Full<hyper::body::Bytes>> {
    Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .body(empty_body())
        .unwrap()
}

#[tokio::test]
async fn test_h2_tunnel_relays_bytes_both_ways() {
    let echo = start_echo_server().await;
    let proxy = spawn_proxy(test_config()).await;
    let mut sender = h2_session(&proxy).await;

    let response = sender
        .send_request(connect_request(&echo.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let upgraded = hyper::upgrade::on(response).await.unwrap();
    let mut tunnel = TokioIo::new(upgraded);

    tunnel.write_all(b"hello through h2").await.unwrap();
    let mut buf = [0u8; 16];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through h2");
}

#[tokio::test]
async fn test_h2_tunnel_half_close_reaches_target() {
    let echo = start_echo_server().await;
    let proxy = spawn_proxy(test_config()).await;
    let mut sender = h2_session(&proxy).await;

    let response = sender
        .send_request(connect_request(&echo.to_string()))
        .await
        .unwrap();
    let mut tunnel = TokioIo::new(hyper::upgrade::on(response).await.unwrap());

    tunnel.write_all(b"last words").await.unwrap();
    tunnel.shutdown().await.unwrap();

    let mut received = Vec::new();
    tunnel.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, [&b"last words"[..], ECHO_TRAILER].concat());
}

#[tokio::test]
async fn test_unresolvable_target_is_404() {
    let proxy = spawn_proxy(test_config()).await;
    let mut sender = h2_session(&proxy).await;

    let response = sender
        .send_request(connect_request("no-such-host.invalid:443"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_refused_target_is_502() {
    let target = closed_port().await;
    let proxy = spawn_proxy(test_config()).await;
    let mut sender = h2_session(&proxy).await;

    let response = sender
        .send_request(connect_request(&target.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_challenge_without_credentials() {
    let echo = start_echo_server().await;
    let mut config = test_config();
    config.authenticate = AuthMode::Challenge("Basic realm=\"proxy\"".to_string());
    let proxy = spawn_proxy(config).await;
    let mut sender = h2_session(&proxy).await;

    let response = sender
        .send_request(connect_request(&echo.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(response.headers()[PROXY_AUTHENTICATE], "Basic realm=\"proxy\"");

    // Any credential value passes the gate.
    let mut request = connect_request(&echo.to_string());
    request
        .headers_mut()
        .insert(PROXY_AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_blind_auth_has_no_challenge_header() {
    let echo = start_echo_server().await;
    let mut config = test_config();
    config.authenticate = AuthMode::Blind;
    let proxy = spawn_proxy(config).await;
    let mut sender = h2_session(&proxy).await;

    let response = sender
        .send_request(connect_request(&echo.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert!(response.headers().get(PROXY_AUTHENTICATE).is_none());
}

#[tokio::test]
async fn test_http1_tunnel_on_plain_listener() {
    let echo = start_echo_server().await;
    let proxy = spawn_proxy(test_config()).await;

    let mut stream = TcpStream::connect(proxy.plain()).await.unwrap();
    let head = http1_connect(&mut stream, &echo.to_string(), "").await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    stream.write_all(b"plain tunnel").await.unwrap();
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"plain tunnel");
}

#[tokio::test]
async fn test_http1_tunnel_failure_statuses() {
    let refused = closed_port().await;
    let proxy = spawn_proxy(test_config()).await;

    let mut stream = TcpStream::connect(proxy.plain()).await.unwrap();
    let head = http1_connect(&mut stream, &refused.to_string(), "").await;
    assert!(head.starts_with("HTTP/1.1 502"), "unexpected head: {head}");

    let mut stream = TcpStream::connect(proxy.plain()).await.unwrap();
    let head = http1_connect(&mut stream, "no-such-host.invalid:443", "").await;
    assert!(head.starts_with("HTTP/1.1 404"), "unexpected head: {head}");
}

#[tokio::test]
async fn test_tunnel_count_follows_tunnel_lifetime() {
    let echo = start_echo_server().await;
    let proxy = spawn_proxy(test_config()).await;
    let mut events = proxy.registry.subscribe();
    let mut sender = h2_session(&proxy).await;

    let session = match next_event(&mut events).await {
        SessionEvent::Opened { id, .. } => id,
        other => panic!("unexpected event {other:?}"),
    };

    let response = sender
        .send_request(connect_request(&echo.to_string()))
        .await
        .unwrap();
    let mut tunnel = TokioIo::new(hyper::upgrade::on(response).await.unwrap());
    assert_eq!(proxy.registry.tunnel_count(session), Some(1));

    // Finish both directions; the tunnel ends once the target closes.
    tunnel.shutdown().await.unwrap();
    let mut rest = Vec::new();
    tunnel.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, ECHO_TRAILER);

    wait_until(|| proxy.registry.tunnel_count(session) == Some(0)).await;
    assert_eq!(proxy.registry.active_sessions(), 1);
}

#[tokio::test]
async fn test_http1_tunnel_keeps_session_open() {
    let echo = start_echo_server().await;
    let proxy = spawn_proxy(test_config()).await;
    let mut events = proxy.registry.subscribe();

    let mut stream = TcpStream::connect(proxy.plain()).await.unwrap();
    let head = http1_connect(&mut stream, &echo.to_string(), "").await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    let session = match next_event(&mut events).await {
        SessionEvent::Opened { id, .. } => id,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(next_event(&mut events).await, SessionEvent::FirstOpened { id: session });

    stream.write_all(b"live").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"live");

    // The HTTP/1.1 connection has handed its socket to the tunnel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(proxy.registry.tunnel_count(session), Some(1));
    assert_eq!(proxy.registry.active_sessions(), 1);
    assert!(events.try_recv().is_err());

    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, ECHO_TRAILER);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Closed { id, .. } if id == session));
    assert_eq!(next_event(&mut events).await, SessionEvent::AllClosed { id: session });
    assert_eq!(proxy.registry.active_sessions(), 0);
}

#[tokio::test]
async fn test_h2_client_reset_closes_target() {
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    // Never closes on its own; reports when the proxy closes it.
    let origin = start_raw_origin(move |mut socket| {
        let closed_tx = closed_tx.clone();
        async move {
            let mut buf = [0u8; 1024];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
            let _ = closed_tx.send(());
        }
    })
    .await;
    let proxy = spawn_proxy(test_config()).await;
    let mut events = proxy.registry.subscribe();
    let mut sender = h2_session(&proxy).await;

    let session = match next_event(&mut events).await {
        SessionEvent::Opened { id, .. } => id,
        other => panic!("unexpected event {other:?}"),
    };

    let response = sender
        .send_request(connect_request(&origin.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut tunnel = TokioIo::new(hyper::upgrade::on(response).await.unwrap());
    tunnel.write_all(b"ping").await.unwrap();
    tunnel.flush().await.unwrap();
    assert_eq!(proxy.registry.tunnel_count(session), Some(1));

    // Dropping the upgraded stream resets it.
    drop(tunnel);

    let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv()).await;
    assert_eq!(closed.unwrap(), Some(()));
    wait_until(|| proxy.registry.tunnel_count(session) == Some(0)).await;
    assert_eq!(proxy.registry.active_sessions(), 1);
}

#[tokio::test]
async fn test_target_reset_ends_client_stream() {
    // Closing with unread bytes makes the kernel answer with a reset.
    let origin = start_raw_origin(|socket| async move {
        let _ = socket.readable().await;
        drop(socket);
    })
    .await;
    let proxy = spawn_proxy(test_config()).await;
    let mut events = proxy.registry.subscribe();
    let mut sender = h2_session(&proxy).await;

    let session = match next_event(&mut events).await {
        SessionEvent::Opened { id, .. } => id,
        other => panic!("unexpected event {other:?}"),
    };

    let response = sender
        .send_request(connect_request(&origin.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut tunnel = TokioIo::new(hyper::upgrade::on(response).await.unwrap());
    tunnel.write_all(b"unread").await.unwrap();
    tunnel.flush().await.unwrap();

    let mut received = Vec::new();
    let ended = tokio::time::timeout(Duration::from_secs(5), tunnel.read_to_end(&mut received)).await;
    assert!(ended.is_ok(), "client stream still open after target reset");
    assert!(received.is_empty());

    wait_until(|| proxy.registry.tunnel_count(session) == Some(0)).await;
}
