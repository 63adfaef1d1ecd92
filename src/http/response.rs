//! Response bodies and canned responses.

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};

/// Body type for everything the proxy answers with.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// A plain-text error response.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut message = message.into();
    message.push('\n');
    let mut res = Response::new(full(message));
    *res.status_mut() = status;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

/// Raw HTTP/1.x error for connections hyper never saw.
pub fn raw_error(status: StatusCode, message: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        message.len() + 1,
        message
    )
}
