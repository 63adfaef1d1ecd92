//! Connection dispatcher.
//!
//! # Responsibilities
//! - Accept client connections under the listener's connection limit
//! - Peek the first request head without consuming it
//! - Hand CONNECT sockets straight to the tunnel
//! - Serve everything else with hyper's HTTP/1 server
//! - Stop accepting on shutdown and drain in-flight connections

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::connect::{hijack, tunnel_raw};
use crate::http::forward::forward;
use crate::http::request::{RequestHead, HEADER_SECTION_MAX_LENGTH};
use crate::http::response::{raw_error, ProxyBody};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::dial::{Dialer, RelayNode, RoutingDecision, SecureTransport};
use crate::net::listener::{is_transient, ConnectionPermit, Listener};
use crate::net::prebuffered::Prebuffered;

/// How long shutdown waits for open connections before returning.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared by every connection task.
#[derive(Clone)]
pub struct AppState {
    pub dialer: Arc<Dialer>,
    pub idle_timeout: Duration,
}

/// A connection's listener permit and live-count slot.
///
/// Shared between the connection task and any tunnel hijacked from it, so the
/// slot is released only when the last of them ends.
struct ConnectionSlot {
    _permit: ConnectionPermit,
    _guard: ConnectionGuard,
}

/// HTTP/1 proxy server.
pub struct HttpServer {
    state: AppState,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Build a server around the given transport and routing decision.
    pub fn new(
        config: &ProxyConfig,
        transport: Arc<dyn SecureTransport>,
        routing: Arc<dyn RoutingDecision>,
    ) -> Self {
        let relay = RelayNode {
            address: config.upstream.relay_address.clone(),
            secret: Arc::from(config.upstream.password.as_bytes()),
        };
        let dialer = Dialer::new(relay, transport, routing, config.timeouts.connect());
        Self {
            state: AppState {
                dialer: Arc::new(dialer),
                idle_timeout: config.timeouts.idle(),
            },
            tracker: ConnectionTracker::new(),
        }
    }

    /// Accept connections until shutdown or a fatal accept error.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), ProxyError> {
        if let Ok(addr) = listener.local_addr() {
            info!(
                address = %addr,
                max_connections = listener.max_connections(),
                relay = %self.state.dialer.relay_address(),
                "HTTP proxy listening"
            );
        }

        let result = loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.triggered() => {
                    info!("Shutdown signal received, no longer accepting");
                    break Ok(());
                }
            };

            let (stream, peer, permit) = match accepted {
                Ok(conn) => conn,
                Err(ProxyError::Accept(e)) if is_transient(&e) => {
                    warn!(error = %e, "Transient accept error");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Listener failed");
                    break Err(e);
                }
            };

            let guard = self.tracker.open(peer);
            let span = guard.span();
            let slot = Arc::new(ConnectionSlot {
                _permit: permit,
                _guard: guard,
            });
            let state = self.state.clone();
            tokio::spawn(serve_connection(stream, peer, state, slot).instrument(span));
        };

        let remaining = self.tracker.drain(SHUTDOWN_GRACE).await;
        if remaining > 0 {
            warn!(remaining, "Connections still open after shutdown grace period");
        }
        info!("HTTP proxy stopped");
        result
    }
}

/// Route one client connection by its first request head.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
    slot: Arc<ConnectionSlot>,
) {
    stream.set_nodelay(true).ok();
    let mut reader = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);

    let (len, head) =
        match tokio::time::timeout(state.idle_timeout, RequestHead::peek(&mut reader)).await {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(ProxyError::Io(e))) => {
                debug!(error = %e, "Client closed before a request head");
                return;
            }
            Ok(Err(e)) => {
                reject(reader, e).await;
                return;
            }
            Err(_) => {
                debug!("Idle connection closed");
                return;
            }
        };

    if head.is_connect() {
        debug!(target = %head.target, version = ?head.version, "CONNECT");
        reader.discard(len);
        tunnel_raw(reader, head.proto(), &head.target, &state.dialer).await;
        return;
    }

    let service_state = state.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let state = service_state.clone();
        let slot = Arc::clone(&slot);
        async move { Ok::<_, Infallible>(dispatch(req, peer, &state, slot).await) }
    });

    // No automatic `date`: the `200 Connection established` head of a
    // hijacked CONNECT must go out without headers.
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .auto_date_header(false)
        .header_read_timeout(state.idle_timeout)
        .serve_connection(TokioIo::new(reader), service)
        .with_upgrades();
    if let Err(e) = conn.await {
        debug!(error = %e, "Connection ended with error");
    }
}

async fn dispatch(
    req: Request<Incoming>,
    peer: SocketAddr,
    state: &AppState,
    slot: Arc<ConnectionSlot>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        hijack(req, Arc::clone(&state.dialer), slot)
    } else {
        forward(req, peer, &state.dialer).await
    }
}

/// Answer a request head hyper never saw, then close.
async fn reject(mut reader: Prebuffered<TcpStream>, err: ProxyError) {
    let status = match err {
        ProxyError::HeaderTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    debug!(error = %err, %status, "Rejecting request head");
    let response = raw_error(status, &err.to_string());
    reader.write_all(response.as_bytes()).await.ok();
    reader.shutdown().await.ok();
}
