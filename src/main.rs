//! sower-proxy: HTTP/1 forward proxy with relay tunneling.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ http::server (peek request head)
//!                                     │
//!                     ┌───────────────┴───────────────┐
//!                     ▼                               ▼
//!              CONNECT tunnel                  plain HTTP request
//!              http::connect                   http::forward
//!                     │                               │
//!          routing::DomainRules                       │
//!            │               │                        │
//!            ▼               ▼                        ▼
//!       direct TCP     transport::ConnectRelayTransport ──▶ relay node
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use sower_proxy::config::loader::{load_config, ConfigError};
use sower_proxy::config::ProxyConfig;
use sower_proxy::lifecycle::Shutdown;
use sower_proxy::observability::{logging, metrics};
use sower_proxy::{ConnectRelayTransport, DomainRules, HttpServer, Listener};

#[derive(Parser)]
#[command(name = "sower-proxy")]
#[command(about = "HTTP/1 forward proxy that tunnels through a relay node", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`
    #[arg(short, long)]
    listen: Option<String>,

    /// Relay node address, overrides `upstream.relay_address`
    #[arg(short, long)]
    relay: Option<String>,

    /// Shared secret for the relay node, overrides `upstream.password`
    #[arg(short, long, env = "SOWER_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl Cli {
    fn load(self) -> Result<ProxyConfig, ConfigError> {
        let Cli {
            config,
            listen,
            relay,
            password,
        } = self;
        load_config(config.as_deref(), |config| {
            if let Some(listen) = listen {
                config.listener.bind_address = listen;
            }
            if let Some(relay) = relay {
                config.upstream.relay_address = relay;
            }
            if let Some(password) = password {
                config.upstream.password = password;
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().load()?;

    logging::init_tracing(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sower-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        relay = %config.upstream.relay_address,
        default_route = ?config.routing.default_route,
        relay_domains = config.routing.relay_domains.len(),
        direct_domains = config.routing.direct_domains.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let listener = Listener::bind(&config.listener).await?;

    let transport = Arc::new(ConnectRelayTransport::new(config.timeouts.handshake()));
    let routing = Arc::new(DomainRules::from_config(&config.routing));
    let server = HttpServer::new(&config, transport, routing);

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
