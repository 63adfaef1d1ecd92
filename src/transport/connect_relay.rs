//! Relay node reached through an authenticated HTTP CONNECT.
//!
//! # Handshake
//! ```text
//! TCP connect(relay_node)
//!     → CONNECT <target> HTTP/1.1
//!       Host: <target>
//!       Proxy-Authorization: Basic base64(secret)
//!     ← HTTP/1.1 200 ...
//!     → stream (plus any bytes the relay sent after its reply head)
//! ```
//!
//! Anything but a `200` fails the dial. The whole handshake is bounded by
//! the handshake timeout.

use std::io;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::http::request::HEADER_SECTION_MAX_LENGTH;
use crate::net::dial::{BoxConn, SecureTransport};
use crate::net::prebuffered::Prebuffered;

const MAX_HEADERS: usize = 64;

/// `SecureTransport` that tunnels through an HTTP CONNECT relay.
#[derive(Debug, Clone)]
pub struct ConnectRelayTransport {
    handshake_timeout: Duration,
}

impl ConnectRelayTransport {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    async fn handshake(
        &self,
        relay_node: &str,
        target: &str,
        secret: &[u8],
    ) -> io::Result<BoxConn> {
        let stream = TcpStream::connect(relay_node).await?;
        stream.set_nodelay(true).ok();

        let mut conn = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);
        conn.write_all(connect_request(target, secret).as_bytes()).await?;

        let (len, status) = read_status(&mut conn).await?;
        if status != StatusCode::OK {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("relay refused tunnel: {status}"),
            ));
        }
        conn.discard(len);
        trace!(relay_node, target, "relay tunnel open");
        Ok(Box::new(conn))
    }
}

impl SecureTransport for ConnectRelayTransport {
    fn dial<'a>(
        &'a self,
        relay_node: &'a str,
        target: &'a str,
        secret: &'a [u8],
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        Box::pin(async move {
            match tokio::time::timeout(
                self.handshake_timeout,
                self.handshake(relay_node, target, secret),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "relay handshake timed out",
                )),
            }
        })
    }
}

fn connect_request(target: &str, secret: &[u8]) -> String {
    let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if !secret.is_empty() {
        req.push_str("Proxy-Authorization: Basic ");
        req.push_str(&STANDARD.encode(secret));
        req.push_str("\r\n");
    }
    req.push_str("\r\n");
    req
}

/// Read the relay's reply head. Returns its length and status.
async fn read_status<S: AsyncRead + Unpin>(
    reader: &mut Prebuffered<S>,
) -> io::Result<(usize, StatusCode)> {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(reader.buffer()) {
            Ok(httparse::Status::Complete(len)) => {
                let status = res
                    .code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or_else(|| invalid_data("relay reply has no valid status"))?;
                return Ok((len, status));
            }
            Ok(httparse::Status::Partial) => {}
            Err(e) => return Err(invalid_data(format!("malformed relay reply: {e}"))),
        }
        if reader.is_full() {
            return Err(invalid_data("relay reply head too large"));
        }
        reader.buffer_more().await?;
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
