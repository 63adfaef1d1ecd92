//! Host/port normalization.
//!
//! Clients send `Host` values and CONNECT authorities with or without a
//! port. Everything downstream dials `host:port`, so the port is made
//! explicit here, once per request.

use std::fmt;

/// Default port for CONNECT targets.
pub const HTTPS_DEFAULT_PORT: u16 = 443;
/// Default port for plain HTTP destinations.
pub const HTTP_DEFAULT_PORT: u16 = 80;

/// A dial target: `host:port` plus the bare host used for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Address with an explicit port, ready to dial.
    pub addr: String,
    /// Host without port or IPv6 brackets.
    pub host: String,
}

impl Target {
    /// Attach `default_port` to `raw` unless it already carries a port.
    ///
    /// Never fails. Input that does not look like a host is passed through
    /// verbatim so the dial reports the problem.
    pub fn normalize(raw: &str, default_port: u16) -> Self {
        if let Some(rest) = raw.strip_prefix('[') {
            // Bracketed IPv6 literal, with or without a port.
            return match rest.split_once(']') {
                Some((host, "")) => Self {
                    addr: format!("{raw}:{default_port}"),
                    host: host.to_string(),
                },
                Some((host, port)) if port.starts_with(':') => Self {
                    addr: raw.to_string(),
                    host: host.to_string(),
                },
                _ => Self::verbatim(raw),
            };
        }

        match raw.matches(':').count() {
            0 => Self {
                addr: format!("{raw}:{default_port}"),
                host: raw.to_string(),
            },
            1 => {
                let host = raw.split_once(':').map(|(h, _)| h).unwrap_or(raw);
                Self {
                    addr: raw.to_string(),
                    host: host.to_string(),
                }
            }
            // Unbracketed IPv6 literal: no port can be told apart.
            _ => Self {
                addr: format!("[{raw}]:{default_port}"),
                host: raw.to_string(),
            },
        }
    }

    fn verbatim(raw: &str) -> Self {
        Self {
            addr: raw.to_string(),
            host: raw.to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}
