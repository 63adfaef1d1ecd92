//! CONNECT tunnel tests against a running proxy.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

use common::{read_head, LoopbackTransport, RELAY_NODE, SECRET};

const ESTABLISHED_11: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

async fn expect_echo(stream: &mut TcpStream, payload: &[u8]) {
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_connect_relays_bytes_through_relay_node() {
    let echo = common::start_echo_server().await;
    let transport = Arc::new(LoopbackTransport::new().route("example.com:443", echo));
    let proxy = common::start_proxy(transport.clone(), common::relay_everything()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let mut ack = vec![0u8; ESTABLISHED_11.len()];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, ESTABLISHED_11);

    client.write_all(b"PING").await.unwrap();
    expect_echo(&mut client, b"PING").await;

    let dials = transport.dials.lock().unwrap().clone();
    assert_eq!(
        dials,
        vec![(
            RELAY_NODE.to_string(),
            "example.com:443".to_string(),
            SECRET.as_bytes().to_vec()
        )]
    );
}

#[tokio::test]
async fn test_bytes_pipelined_after_connect_head_reach_upstream() {
    let echo = common::start_echo_server().await;
    let transport = Arc::new(LoopbackTransport::new().route("example.com:443", echo));
    let proxy = common::start_proxy(transport, common::relay_everything()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com HTTP/1.1\r\n\r\nEARLY")
        .await
        .unwrap();

    let mut ack = vec![0u8; ESTABLISHED_11.len()];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, ESTABLISHED_11);
    expect_echo(&mut client, b"EARLY").await;
}

#[tokio::test]
async fn test_http10_connect_echoes_protocol() {
    let echo = common::start_echo_server().await;
    let transport = Arc::new(LoopbackTransport::new().route("example.com:443", echo));
    let proxy = common::start_proxy(transport, common::relay_everything()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut client).await.unwrap();
    assert_eq!(head, "HTTP/1.0 200 Connection established\r\n\r\n");
}

#[tokio::test]
async fn test_dial_failure_is_reported_inside_tunnel() {
    let transport = Arc::new(LoopbackTransport::new());
    let proxy = common::start_proxy(transport.clone(), common::relay_everything()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT unreachable.test:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut seen = String::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_string(&mut seen))
        .await
        .expect("proxy did not close the tunnel")
        .unwrap();
    assert_eq!(
        seen,
        format!("HTTP/1.1 200 Connection established\r\n\r\nsower dial {RELAY_NODE} fail: relay down")
    );
    assert_eq!(transport.targets(), vec!["unreachable.test:443".to_string()]);
}

#[tokio::test]
async fn test_direct_route_bypasses_transport() {
    let echo = common::start_echo_server().await;
    let transport = Arc::new(LoopbackTransport::new());
    let proxy = common::start_proxy(transport.clone(), common::relay_nothing()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut ack = vec![0u8; ESTABLISHED_11.len()];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, ESTABLISHED_11);

    client.write_all(b"direct").await.unwrap();
    expect_echo(&mut client, b"direct").await;
    assert!(transport.targets().is_empty());
}

#[tokio::test]
async fn test_connect_after_request_on_persistent_connection() {
    let (backend, _) = common::start_mock_backend("ok").await;
    let echo = common::start_echo_server().await;
    let transport = Arc::new(
        LoopbackTransport::new()
            .route("example.com:80", backend)
            .route("example.com:443", echo),
    );
    let proxy = common::start_proxy(transport.clone(), common::relay_everything()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
    assert!(!head.to_ascii_lowercase().contains("connection: close"));
    let mut body = [0u8; 2];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"ok");

    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client).await.unwrap();
    assert_eq!(head, "HTTP/1.1 200 Connection established\r\n\r\n");

    client.write_all(b"PING").await.unwrap();
    expect_echo(&mut client, b"PING").await;
    assert_eq!(
        transport.targets(),
        vec!["example.com:80".to_string(), "example.com:443".to_string()]
    );
}

#[tokio::test]
async fn test_tunnel_after_request_holds_its_connection_slot() {
    let (backend, _) = common::start_mock_backend("ok").await;
    let echo = common::start_echo_server().await;
    let transport = Arc::new(
        LoopbackTransport::new()
            .route("example.com:80", backend)
            .route("example.com:443", echo),
    );
    let proxy = common::start_proxy_with(transport, common::relay_everything(), |config| {
        config.listener.max_connections = 1;
    })
    .await;

    let mut first = TcpStream::connect(proxy.addr).await.unwrap();
    first
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    read_head(&mut first).await.unwrap();
    let mut body = [0u8; 2];
    first.read_exact(&mut body).await.unwrap();
    first
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    read_head(&mut first).await.unwrap();
    first.write_all(b"PING").await.unwrap();
    expect_echo(&mut first, b"PING").await;

    // The only slot belongs to the open tunnel, so a second client waits.
    let mut second = TcpStream::connect(proxy.addr).await.unwrap();
    second
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let waiting = tokio::time::timeout(Duration::from_millis(300), read_head(&mut second)).await;
    assert!(waiting.is_err(), "second client served while the tunnel was open");

    drop(first);
    let head = tokio::time::timeout(Duration::from_secs(5), read_head(&mut second))
        .await
        .expect("slot was not released when the tunnel closed")
        .unwrap();
    assert_eq!(head, "HTTP/1.1 200 Connection established\r\n\r\n");
}

#[tokio::test]
async fn test_tunnel_closes_when_upstream_closes() {
    let (backend, _) = common::start_mock_backend("bye").await;
    let transport = Arc::new(LoopbackTransport::new().route("example.com:443", backend));
    let proxy = common::start_proxy(transport, common::relay_everything()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let ack = read_head(&mut client).await.unwrap();
    assert!(ack.starts_with("HTTP/1.1 200"));

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let mut rest = String::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_string(&mut rest))
        .await
        .expect("tunnel stayed open")
        .unwrap();
    assert!(rest.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(rest.ends_with("bye"));
}

#[tokio::test]
async fn test_shutdown_stops_accept_loop() {
    let transport = Arc::new(LoopbackTransport::new());
    let proxy = common::start_proxy(transport, common::relay_everything()).await;

    proxy.shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_dropped_shutdown_handle_does_not_stop_server() {
    let echo = common::start_echo_server().await;
    let transport = Arc::new(LoopbackTransport::new().route("example.com:443", echo));
    let common::TestProxy {
        addr,
        shutdown,
        handle,
    } = common::start_proxy(transport, common::relay_everything()).await;

    drop(shutdown);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut client).await.unwrap();
    assert_eq!(head, "HTTP/1.1 200 Connection established\r\n\r\n");
}
