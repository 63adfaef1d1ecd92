//! CONNECT tunnel handling.
//!
//! # Tunnel States
//! ```text
//! Received → Hijacked → TunnelEstablished → Relaying → Closed
//!               │               │
//!               └───────────────┴──(write or dial failure)──→ Closed
//! ```
//!
//! The `200 Connection established` line goes out before the upstream dial.
//! A failed dial is reported as plain text inside the open tunnel, then the
//! client connection is closed.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response, StatusCode};
use hyper::ext::ReasonPhrase;
use hyper::upgrade::{OnUpgrade, Parts, Upgraded};
use hyper_util::rt::TokioIo;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn, Instrument};

use crate::error::DialError;
use crate::http::response::{empty, error_response, ProxyBody};
use crate::net::address::{Target, HTTPS_DEFAULT_PORT};
use crate::net::dial::{Dialer, Route};
use crate::net::prebuffered::Prebuffered;
use crate::net::relay::{relay, Direction, RelayOutcome};
use crate::observability::metrics;

const ESTABLISHED: &str = "200 Connection established\r\n\r\n";

/// A client connection taken away from the HTTP layer.
pub enum ClientConn {
    /// The socket itself, with any bytes read past the CONNECT head.
    Raw(Prebuffered<TcpStream>),
    /// An upgraded hyper connection that could not be unwrapped.
    Upgraded(TokioIo<Upgraded>),
}

impl ClientConn {
    /// Reclaim the raw socket from a hyper upgrade when it is ours.
    pub fn from_upgraded(upgraded: Upgraded) -> Self {
        match upgraded.downcast::<TokioIo<Prebuffered<TcpStream>>>() {
            Ok(Parts { io, read_buf, .. }) => {
                let mut raw = io.into_inner();
                raw.unread(read_buf);
                ClientConn::Raw(raw)
            }
            Err(upgraded) => ClientConn::Upgraded(TokioIo::new(upgraded)),
        }
    }

    fn set_keepalive(&self) -> io::Result<()> {
        match self {
            ClientConn::Raw(stream) => SockRef::from(stream.get_ref()).set_keepalive(true),
            ClientConn::Upgraded(_) => Err(io::ErrorKind::Unsupported.into()),
        }
    }
}

impl AsyncRead for ClientConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientConn::Raw(s) => Pin::new(s).poll_read(cx, buf),
            ClientConn::Upgraded(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientConn::Raw(s) => Pin::new(s).poll_write(cx, buf),
            ClientConn::Upgraded(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientConn::Raw(s) => Pin::new(s).poll_flush(cx),
            ClientConn::Upgraded(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientConn::Raw(s) => Pin::new(s).poll_shutdown(cx),
            ClientConn::Upgraded(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Whether the `200` line still has to be written.
#[derive(Debug, Clone, Copy)]
pub enum Acknowledgement {
    /// Write it, echoing this protocol token.
    Pending(&'static str),
    /// hyper already answered the CONNECT.
    Sent,
}

/// How a tunnel ended.
#[derive(Debug)]
pub enum TunnelOutcome {
    /// The `200` line could not be written.
    AckFailed(io::Error),
    /// The upstream dial failed; the client got a diagnostic.
    DialFailed(DialError),
    /// The relay ran and finished.
    Relayed { route: Route, outcome: RelayOutcome },
}

/// Drive a hijacked CONNECT from the acknowledgement to close.
pub async fn run_tunnel<C>(
    mut client: C,
    keepalive: impl FnOnce(&C) -> io::Result<()>,
    ack: Acknowledgement,
    target: &Target,
    dialer: &Dialer,
) -> TunnelOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = keepalive(&client) {
        trace!(error = %e, "TCP keep-alive not enabled");
    }

    if let Acknowledgement::Pending(proto) = ack {
        let line = format!("{proto} {ESTABLISHED}");
        if let Err(e) = client.write_all(line.as_bytes()).await {
            client.shutdown().await.ok();
            return TunnelOutcome::AckFailed(e);
        }
    }

    let route = dialer.route(&target.host);
    let mut upstream = match dialer.dial(target, route).await {
        Ok(conn) => conn,
        Err(e) => {
            metrics::record_dial_failure(route);
            let diagnostic = format!("sower dial {} fail: {}", dialer.relay_address(), e.io());
            client.write_all(diagnostic.as_bytes()).await.ok();
            client.shutdown().await.ok();
            return TunnelOutcome::DialFailed(e);
        }
    };
    metrics::record_tunnel(route);
    debug!(target = %target, %route, "tunnel established");

    let outcome = relay(&mut client, &mut upstream).await;
    metrics::record_relay_bytes(Direction::AToB, outcome.a_to_b);
    metrics::record_relay_bytes(Direction::BToA, outcome.b_to_a);
    upstream.shutdown().await.ok();
    client.shutdown().await.ok();

    TunnelOutcome::Relayed { route, outcome }
}

/// Tunnel a CONNECT whose head the dispatcher read off the raw socket.
pub async fn tunnel_raw(
    client: Prebuffered<TcpStream>,
    proto: &'static str,
    authority: &str,
    dialer: &Dialer,
) {
    let target = Target::normalize(authority, HTTPS_DEFAULT_PORT);
    let conn = ClientConn::Raw(client);
    let outcome = run_tunnel(
        conn,
        ClientConn::set_keepalive,
        Acknowledgement::Pending(proto),
        &target,
        dialer,
    )
    .await;
    log_outcome(&target, &outcome);
}

/// Hijack a CONNECT that arrived on a connection hyper is serving.
///
/// hyper writes the `200` itself once this response is returned; the tunnel
/// then runs on a spawned task that keeps `hold` until the tunnel closes.
/// Without an upgrade handle the connection cannot be taken over and the
/// client gets a 503.
pub fn hijack<B, H>(mut req: Request<B>, dialer: Arc<Dialer>, hold: H) -> Response<ProxyBody>
where
    H: Send + 'static,
{
    let authority = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(ToString::to_string)
        })
        .unwrap_or_default();
    let target = Target::normalize(&authority, HTTPS_DEFAULT_PORT);

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        warn!(target = %target, "CONNECT on a connection that cannot be hijacked");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "connection does not support hijacking",
        );
    };

    tokio::spawn(
        async move {
            let _hold = hold;
            match on_upgrade.await {
                Ok(upgraded) => {
                    let conn = ClientConn::from_upgraded(upgraded);
                    let outcome = run_tunnel(
                        conn,
                        ClientConn::set_keepalive,
                        Acknowledgement::Sent,
                        &target,
                        &dialer,
                    )
                    .await;
                    log_outcome(&target, &outcome);
                }
                Err(e) => warn!(target = %target, error = %e, "hijack failed"),
            }
        }
        .in_current_span(),
    );

    let mut res = Response::new(empty());
    res.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    res
}

fn log_outcome(target: &Target, outcome: &TunnelOutcome) {
    match outcome {
        TunnelOutcome::AckFailed(e) => {
            debug!(target = %target, error = %e, "client went away before the tunnel was acknowledged")
        }
        TunnelOutcome::DialFailed(e) => warn!(target = %target, error = %e, "tunnel dial failed"),
        TunnelOutcome::Relayed { route, outcome } => debug!(
            target = %target,
            %route,
            finished = %outcome.finished,
            result = ?outcome.result,
            sent = outcome.a_to_b,
            received = outcome.b_to_a,
            "tunnel closed"
        ),
    }
}
