//! Error types shared across the proxy.

use std::io;

use crate::config::loader::ConfigError;

/// Errors that end the proxy or a single client connection.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listener stopped accepting connections.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The client sent something that is not an HTTP/1.x request head.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request head did not fit in the header buffer.
    #[error("request header section exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from the dial strategy. The source is kept verbatim.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// Direct TCP dial to the destination failed.
    #[error("dial {addr}: {source}")]
    Direct {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The secure transport could not reach the target through the relay node.
    #[error("relay {relay_node} to {target}: {source}")]
    Relay {
        relay_node: String,
        target: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// The underlying transport error.
    pub fn io(&self) -> &io::Error {
        match self {
            DialError::Direct { source, .. } | DialError::Relay { source, .. } => source,
        }
    }
}

