//! HTTP/1 forward proxy that tunnels through a relay node.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod transport;

pub use config::schema::ProxyConfig;
pub use error::{DialError, ProxyError};
pub use http::HttpServer;
pub use lifecycle::{Shutdown, ShutdownSignal};
pub use net::dial::{BoxConn, RoutingDecision, SecureTransport};
pub use net::listener::Listener;
pub use routing::DomainRules;
pub use transport::ConnectRelayTransport;
