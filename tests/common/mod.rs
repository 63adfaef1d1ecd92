//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use sower_proxy::config::ProxyConfig;
use sower_proxy::{BoxConn, HttpServer, Listener, ProxyError, RoutingDecision, SecureTransport, Shutdown};

pub const RELAY_NODE: &str = "relay.test:9000";
pub const SECRET: &str = "s3cret";

/// Start a mock backend that answers every connection with `body`.
///
/// Returns the backend address and the request heads it has seen.
pub async fn start_mock_backend(body: &'static str) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let heads = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let heads = heads.clone();
            tokio::spawn(async move {
                let Ok(head) = read_head(&mut socket).await else {
                    return;
                };
                heads.lock().unwrap().push(head);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, seen)
}

/// Start a server that echoes every byte back.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Read up to and including the blank line that ends a message head.
pub async fn read_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A `SecureTransport` that connects each target to a local stand-in.
///
/// Targets without a stand-in fail like an unreachable relay node.
#[derive(Default)]
pub struct LoopbackTransport {
    routes: HashMap<String, SocketAddr>,
    pub dials: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, target: &str, to: SocketAddr) -> Self {
        self.routes.insert(target.to_string(), to);
        self
    }

    pub fn targets(&self) -> Vec<String> {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .map(|(_, target, _)| target.clone())
            .collect()
    }
}

impl SecureTransport for LoopbackTransport {
    fn dial<'a>(
        &'a self,
        relay_node: &'a str,
        target: &'a str,
        secret: &'a [u8],
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        Box::pin(async move {
            self.dials.lock().unwrap().push((
                relay_node.to_string(),
                target.to_string(),
                secret.to_vec(),
            ));
            let Some(addr) = self.routes.get(target) else {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "relay down"));
            };
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as BoxConn)
        })
    }
}

/// A running proxy under test.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), ProxyError>>,
}

/// Start the proxy on an ephemeral port.
pub async fn start_proxy(
    transport: Arc<LoopbackTransport>,
    routing: Arc<dyn RoutingDecision>,
) -> TestProxy {
    start_proxy_with(transport, routing, |_| {}).await
}

/// Start the proxy after adjusting the test configuration.
pub async fn start_proxy_with(
    transport: Arc<LoopbackTransport>,
    routing: Arc<dyn RoutingDecision>,
    configure: impl FnOnce(&mut ProxyConfig),
) -> TestProxy {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.relay_address = RELAY_NODE.into();
    config.upstream.password = SECRET.into();
    configure(&mut config);

    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(&config, transport, routing);

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    let handle = tokio::spawn(server.run(listener, rx));
    TestProxy {
        addr,
        shutdown,
        handle,
    }
}

pub fn relay_everything() -> Arc<dyn RoutingDecision> {
    Arc::new(|_: &str| true)
}

pub fn relay_nothing() -> Arc<dyn RoutingDecision> {
    Arc::new(|_: &str| false)
}
