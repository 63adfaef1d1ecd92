//! Dial strategy: direct TCP or the secure transport, per host.
//!
//! # Data Flow
//! ```text
//! Target (host:port, host)
//!     → RoutingDecision::should_relay(host)
//!         true  → SecureTransport::dial(relay_node, target, secret)
//!         false → TcpStream::connect(target)
//!     → BoxConn, owned by the caller
//! ```
//!
//! Errors come back verbatim; nothing here retries.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::DialError;
use crate::net::address::Target;

/// A bidirectional byte stream to an upstream.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

/// The secure transport used to reach the relay node.
///
/// Opaque to the proxy: it gets the relay node address, the target the
/// relay node should connect to, and the shared secret.
pub trait SecureTransport: Send + Sync {
    fn dial<'a>(
        &'a self,
        relay_node: &'a str,
        target: &'a str,
        secret: &'a [u8],
    ) -> BoxFuture<'a, io::Result<BoxConn>>;
}

/// Per-host choice between the relay node and a direct dial.
///
/// Must be a quick, side-effect free function of the host name.
pub trait RoutingDecision: Send + Sync {
    fn should_relay(&self, host: &str) -> bool;
}

impl<F> RoutingDecision for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn should_relay(&self, host: &str) -> bool {
        self(host)
    }
}

/// The path a dial took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relay,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Relay => "relay",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay node settings handed to the [`Dialer`] at construction.
#[derive(Clone)]
pub struct RelayNode {
    /// Address of the relay node.
    pub address: String,
    /// Shared secret for the secure transport.
    pub secret: Arc<[u8]>,
}

impl fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayNode")
            .field("address", &self.address)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Chooses and performs upstream dials.
#[derive(Clone)]
pub struct Dialer {
    relay: RelayNode,
    transport: Arc<dyn SecureTransport>,
    routing: Arc<dyn RoutingDecision>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(
        relay: RelayNode,
        transport: Arc<dyn SecureTransport>,
        routing: Arc<dyn RoutingDecision>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            transport,
            routing,
            connect_timeout,
        }
    }

    /// Address of the relay node, as named in diagnostics.
    pub fn relay_address(&self) -> &str {
        &self.relay.address
    }

    /// Evaluate the routing decision for a host.
    pub fn route(&self, host: &str) -> Route {
        if self.routing.should_relay(host) {
            Route::Relay
        } else {
            Route::Direct
        }
    }

    /// Dial along an already decided route.
    pub async fn dial(&self, target: &Target, route: Route) -> Result<BoxConn, DialError> {
        match route {
            Route::Relay => self.dial_relay(&target.addr).await,
            Route::Direct => self.dial_direct(&target.addr).await,
        }
    }

    /// Dial through the secure transport, whatever the routing says.
    pub async fn dial_relay(&self, addr: &str) -> Result<BoxConn, DialError> {
        self.transport
            .dial(&self.relay.address, addr, &self.relay.secret)
            .await
            .map_err(|source| DialError::Relay {
                relay_node: self.relay.address.clone(),
                target: addr.to_string(),
                source,
            })
    }

    async fn dial_direct(&self, addr: &str) -> Result<BoxConn, DialError> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
        .map_err(|source| DialError::Direct {
            addr: addr.to_string(),
            source,
        })?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("relay", &self.relay)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
