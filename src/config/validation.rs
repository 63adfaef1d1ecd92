//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Require a relay node, since plain HTTP is always relayed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = config.listener.bind_address.parse::<SocketAddr>() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not a socket address ({e})", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new(
            "listener.max_connections",
            "must be greater than zero",
        ));
    }

    if config.upstream.relay_address.trim().is_empty() {
        errors.push(ValidationError::new(
            "upstream.relay_address",
            "a relay node address is required",
        ));
    }

    for (field, secs) in [
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.idle_secs", config.timeouts.idle_secs),
        ("timeouts.handshake_secs", config.timeouts.handshake_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    let domains = config
        .routing
        .relay_domains
        .iter()
        .map(|d| ("routing.relay_domains", d))
        .chain(
            config
                .routing
                .direct_domains
                .iter()
                .map(|d| ("routing.direct_domains", d)),
        );
    for (field, domain) in domains {
        if domain.trim().trim_start_matches('.').is_empty() {
            errors.push(ValidationError::new(field, "empty domain entry"));
        }
    }

    if config.observability.metrics_enabled {
        if let Err(e) = config.observability.metrics_address.parse::<SocketAddr>() {
            errors.push(ValidationError::new(
                "observability.metrics_address",
                format!("{e}"),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
