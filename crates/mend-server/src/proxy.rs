//! Host-based port proxy.
//!
//! Requests addressed to `pN.localhost[:port]`, where N is a valid
//! non-zero TCP port, are proxied to `127.0.0.1:N`. Any other host falls
//! through to the normal routes.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::SharedState;

/// Headers that must not be forwarded hop to hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Extract the target port from a proxy host name.
///
/// Returns the port as a string for `pN.localhost` or `pN.localhost:any`,
/// empty otherwise.
pub fn parse_port_proxy_host(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    let Some(rest) = host.strip_prefix('p') else {
        return String::new();
    };
    let Some(port_str) = rest.strip_suffix(".localhost") else {
        return String::new();
    };
    if port_str.is_empty() {
        return String::new();
    }
    match port_str.parse::<u32>() {
        Ok(port) if port >= 1 && port <= u16::MAX as u32 => port_str.to_string(),
        _ => String::new(),
    }
}

/// Middleware: divert proxy-host requests before normal routing.
pub async fn port_proxy_middleware(
    State(_state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let port = parse_port_proxy_host(&host);
    if port.is_empty() {
        return next.run(req).await;
    }
    debug!(host = %host, port = %port, "proxying request");
    match proxy_request(req, &port).await {
        Ok(resp) => resp,
        Err(e) => (StatusCode::BAD_GATEWAY, format!("proxy error: {e}")).into_response(),
    }
}

async fn proxy_request(req: Request, port: &str) -> Result<Response, reqwest::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://127.0.0.1:{port}{path_and_query}");

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let headers = filter_headers(req.headers());
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let client = reqwest::Client::new();
    let mut outbound = client.request(method, &url);
    for (name, value) in headers.iter() {
        outbound = outbound.header(name.as_str(), value.as_bytes());
    }
    let upstream = outbound.body(body.to_vec()).send().await?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let bytes = upstream.bytes().await?;
    Ok(builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()))
}

fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}
