//! Forward-proxy path for plain HTTP.
//!
//! Every non-CONNECT request is sent through the secure transport. The
//! destination is already in the request line, so per-host bypass is left
//! to the relay node. Bodies stream untouched; only hop-by-hop headers are
//! removed on the way through.

use std::error::Error as StdError;
use std::net::SocketAddr;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn, Instrument};

use crate::http::response::{empty, error_response, ProxyBody};
use crate::net::address::{Target, HTTP_DEFAULT_PORT};
use crate::net::dial::Dialer;
use crate::observability::metrics;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forward a plain HTTP request through the relay node.
pub async fn forward<B>(req: Request<B>, client_addr: SocketAddr, dialer: &Dialer) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let Some(destination) = destination(&req) else {
        metrics::record_forward(StatusCode::BAD_REQUEST.as_u16());
        return error_response(StatusCode::BAD_REQUEST, "missing destination host");
    };
    let target = Target::normalize(&destination, HTTP_DEFAULT_PORT);
    let req = rewrite_request(req, &destination, client_addr);

    debug!(method = %req.method(), target = %target, uri = %req.uri(), "forwarding request");

    let conn = match dialer.dial_relay(&target.addr).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(target = %target, error = %e, "forward dial failed");
            return bad_gateway();
        }
    };

    let (mut sender, connection) = match hyper::client::conn::http1::handshake(TokioIo::new(conn)).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(target = %target, error = %e, "upstream handshake failed");
            return bad_gateway();
        }
    };
    tokio::spawn(
        async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "upstream connection ended with error");
            }
        }
        .in_current_span(),
    );

    match sender.send_request(req).await {
        Ok(mut res) => {
            strip_hop_by_hop(res.headers_mut());
            metrics::record_forward(res.status().as_u16());
            res.map(|body| body.boxed())
        }
        Err(e) => {
            warn!(target = %target, error = %e, "upstream request failed");
            bad_gateway()
        }
    }
}

fn bad_gateway() -> Response<ProxyBody> {
    metrics::record_forward(StatusCode::BAD_GATEWAY.as_u16());
    let mut res = Response::new(empty());
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}

/// Destination authority: absolute-form target first, then `Host`.
fn destination<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(ToString::to_string)
        })
        .filter(|d| !d.is_empty())
}

/// Turn a proxy request into what an origin server expects.
fn rewrite_request<B>(mut req: Request<B>, destination: &str, client_addr: SocketAddr) -> Request<B> {
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);
    if !headers.contains_key(header::HOST) {
        if let Ok(host) = HeaderValue::from_str(destination) {
            headers.insert(header::HOST, host);
        }
    }
    append_forwarded_for(headers, client_addr);
    req
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let ip = client_addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
