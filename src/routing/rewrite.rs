//! Upstream URL rewriting

use axum::http::Uri;
use url::Url;

use super::RoutingError;
use super::registry::ServiceRegistry;
use crate::config::RouteType;

/// Where a matched route sends the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Fixed backend URL.
    Backend(Url),
    /// Logical service resolved per request.
    Service(String),
}

/// Outcome of route matching for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInfo {
    /// Policy the route belongs to.
    pub policy: String,
    /// Endpoint of the matched route.
    pub endpoint: String,
    /// Strategy that matched.
    pub route_type: RouteType,
    /// Target
    pub target: RouteTarget,
    /// Send the backend host as `Host`.
    pub apache_vhost: bool,
    /// Route skips authentication.
    pub unprotected: bool,
}

/// The upstream request location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    /// Full upstream URL.
    pub url: Url,
    /// `Host` header override (apache vhost routes).
    pub host: Option<String>,
    /// Service and node address, when the target was a service.
    pub node: Option<(String, String)>,
}

/// Compute the upstream URL for `uri` according to `info`.
pub async fn rewrite(
    info: &RoutingInfo,
    registry: &dyn ServiceRegistry,
    uri: &Uri,
) -> Result<Rewritten, RoutingError> {
    let (base, node) = match &info.target {
        RouteTarget::Backend(url) => (url.clone(), None),
        RouteTarget::Service(service) => {
            let node = registry.next(service).await?;
            let protocol = if node.protocol.is_empty() {
                "http"
            } else {
                node.protocol.as_str()
            };
            let url = Url::parse(&format!("{protocol}://{}", node.address)).map_err(|e| {
                RoutingError::InvalidRoute {
                    endpoint: info.endpoint.clone(),
                    reason: format!("service node '{}': {e}", node.address),
                }
            })?;
            (url, Some((service.clone(), node.address)))
        }
    };

    let host = base.host_str().unwrap_or_default();
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    // The URL parser would resolve these, sending a path we never checked
    if has_dot_segments(uri.path()) {
        return Err(RoutingError::InvalidRoute {
            endpoint: info.endpoint.clone(),
            reason: "request path contains dot segments".to_string(),
        });
    }
    let path = single_joining_slash(base.path(), uri.path());
    let query = join_query(base.query().unwrap_or_default(), uri.query().unwrap_or_default());

    let mut target = format!("{}://{authority}{path}", base.scheme());
    if !query.is_empty() {
        target.push('?');
        target.push_str(&query);
    }
    let url = Url::parse(&target).map_err(|e| RoutingError::InvalidRoute {
        endpoint: info.endpoint.clone(),
        reason: e.to_string(),
    })?;

    Ok(Rewritten {
        url,
        host: info.apache_vhost.then_some(authority),
        node,
    })
}

/// Whether `path` has a `.` or `..` segment, plain or percent-encoded.
///
/// Backslashes count as separators since URL parsing treats them as `/` for
/// http(s) URLs.
pub fn has_dot_segments(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Join two paths with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

fn join_query(backend: &str, request: &str) -> String {
    if backend.is_empty() || request.is_empty() {
        format!("{backend}{request}")
    } else {
        format!("{backend}&{request}")
    }
}
