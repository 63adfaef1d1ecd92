//! Request head parsing on the raw client socket.
//!
//! # Responsibilities
//! - Read the request line and header section before hyper sees the connection
//! - Classify the request (CONNECT vs. everything else)
//! - Enforce the header section size limit
//!
//! # Design Decisions
//! - Parsing peeks: the head stays buffered, so a non-CONNECT connection is
//!   replayed to hyper untouched
//! - Only HTTP/1.0 and HTTP/1.1 parse; an HTTP/2 preface is a bad request

use http::{Method, Version};
use tokio::io::AsyncRead;

use crate::error::ProxyError;
use crate::net::prebuffered::Prebuffered;

/// How much data to read for a request head before it's considered invalid.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;

const MAX_HEADERS: usize = 64;

/// A parsed HTTP/1.x request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target as sent: authority-form for CONNECT.
    pub target: String,
    pub version: Version,
}

impl RequestHead {
    /// Wait until a complete head is buffered and parse it.
    ///
    /// Nothing is consumed from `reader`. Returns the head length.
    pub async fn peek<S: AsyncRead + Unpin>(
        reader: &mut Prebuffered<S>,
    ) -> Result<(usize, Self), ProxyError> {
        loop {
            if let Some(parsed) = Self::parse_with_len(reader.buffer())? {
                return Ok(parsed);
            }
            if reader.is_full() {
                return Err(ProxyError::HeaderTooLarge {
                    limit: HEADER_SECTION_MAX_LENGTH,
                });
            }
            reader.buffer_more().await?;
        }
    }

    /// Parse a head from `buf`, or `None` if it is incomplete.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::BadRequest(e.to_string())),
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::BadRequest("missing method".into()))?
            .parse::<Method>()
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::BadRequest("missing request target".into()))?
            .to_string();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        Ok(Some((
            len,
            Self {
                method,
                target,
                version,
            },
        )))
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// The protocol token the client declared, for echoing back.
    pub fn proto(&self) -> &'static str {
        proto_str(self.version)
    }
}

/// `HTTP/1.0` or `HTTP/1.1`; anything newer is answered as 1.1.
pub fn proto_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}
