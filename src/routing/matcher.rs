//! Domain-suffix routing rules.
//!
//! # Design Decisions
//! - Host matching is case-insensitive
//! - A rule matches the domain itself and any subdomain of it
//! - Relay rules are checked before direct rules; the default decides the rest
//! - Rules are compiled at startup and immutable at runtime

use crate::config::{DefaultRoute, RoutingConfig};
use crate::net::dial::RoutingDecision;

/// A single domain suffix, stored lowercase without a leading dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSuffix(String);

impl DomainSuffix {
    pub fn new(domain: &str) -> Self {
        Self(domain.trim().trim_start_matches('.').to_ascii_lowercase())
    }

    /// `host` must already be lowercase.
    fn matches(&self, host: &str) -> bool {
        match host.strip_suffix(self.0.as_str()) {
            Some("") => true,
            Some(prefix) => prefix.ends_with('.'),
            None => false,
        }
    }
}

/// Routing decision built from `[routing]`.
#[derive(Debug, Clone)]
pub struct DomainRules {
    relay: Vec<DomainSuffix>,
    direct: Vec<DomainSuffix>,
    default_route: DefaultRoute,
}

impl DomainRules {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            relay: compile(&config.relay_domains),
            direct: compile(&config.direct_domains),
            default_route: config.default_route,
        }
    }
}

fn compile(domains: &[String]) -> Vec<DomainSuffix> {
    domains
        .iter()
        .map(|d| DomainSuffix::new(d))
        .filter(|d| !d.0.is_empty())
        .collect()
}

impl RoutingDecision for DomainRules {
    fn should_relay(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if self.relay.iter().any(|d| d.matches(&host)) {
            return true;
        }
        if self.direct.iter().any(|d| d.matches(&host)) {
            return false;
        }
        matches!(self.default_route, DefaultRoute::Relay)
    }
}
