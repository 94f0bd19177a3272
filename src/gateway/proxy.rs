//! Reverse proxy dispatcher
//!
//! Streams the inbound request to the rewritten upstream URL and streams the
//! upstream response back. Nothing is buffered.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, header},
};
use tracing::{debug, error};

use crate::routing::{Rewritten, ServiceRegistry};

/// Header carrying the resolved identity's token to the backend.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Hop-by-hop headers, never forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream dispatch failures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Could not connect to the upstream.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    /// Upstream connection broke or timed out mid-request.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Forwards requests to backends.
pub struct ProxyDispatcher {
    http: reqwest::Client,
    registry: Arc<dyn ServiceRegistry>,
}

impl ProxyDispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        connect_timeout: Duration,
        read_timeout: Duration,
        insecure: bool,
    ) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            // Bodies pass through with their original encoding
            .no_gzip()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| ProxyError::Client(e.to_string()))?;
        Ok(Self { http, registry })
    }

    /// Send `request` to `target` and return the upstream response.
    pub async fn forward(
        &self,
        request: Request<Body>,
        target: &Rewritten,
        access_token: Option<&str>,
        scheme: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        set_forwarded(&mut headers, &parts.headers, &parts.extensions, scheme);
        if let Some(host) = &target.host {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.insert(header::HOST, value);
            }
        }
        if let Some(token) = access_token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(ACCESS_TOKEN_HEADER, value);
            }
        }

        debug!(method = %parts.method, upstream = %target.url, "Forwarding request");
        let result = self
            .http
            .request(parts.method, target.url.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let upstream = match result {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                if let Some((service, address)) = &target.node {
                    self.registry.report_failure(service, address);
                }
                error!(upstream = %target.url, error = %e, "Upstream unreachable");
                return Err(ProxyError::Unreachable(e.to_string()));
            }
            Err(e) => {
                error!(upstream = %target.url, error = %e, "Upstream request failed");
                return Err(ProxyError::Upstream(e));
            }
        };

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn set_forwarded(
    headers: &mut HeaderMap,
    original: &HeaderMap,
    extensions: &axum::http::Extensions,
    scheme: &str,
) {
    let peer = extensions
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    if let Some(peer) = peer {
        let value = match original
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) => format!("{prior}, {peer}"),
            None => peer,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert("x-forwarded-for", value);
        }
    }
    if !original.contains_key("x-forwarded-host") {
        if let Some(host) = original.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
    }
    if !original.contains_key("x-forwarded-proto") {
        if let Ok(value) = HeaderValue::from_str(scheme) {
            headers.insert("x-forwarded-proto", value);
        }
    }
}

/// Map a dispatch failure to the client-facing status.
pub fn error_status(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::Unreachable(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ProxyError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
