//! Per-policy route table
//!
//! For the selected policy the strategies are tried in a fixed order: query,
//! then regex, then prefix. Within a strategy, routes registered for the
//! request's method come before routes without a method, each group in
//! config order. When nothing matches the root (`/`) route catches the
//! request, method specific first.

use std::collections::HashMap;

use axum::http::{Method, Uri, request::Parts};
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use super::RoutingError;
use super::rewrite::{RouteTarget, RoutingInfo};
use super::selector::PolicySelector;
use crate::config::{PolicyConfig, RouteConfig, RouteType};
use crate::identity::Identity;

#[derive(Debug)]
enum Matcher {
    Prefix(String),
    Query {
        path: String,
        params: Vec<(String, String)>,
    },
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, uri: &Uri) -> bool {
        match self {
            Self::Prefix(endpoint) => endpoint != "/" && uri.path().starts_with(endpoint.as_str()),
            Self::Query { path, params } => {
                // A bare `/` endpoint has no parameters and never matches
                if params.is_empty() || !uri.path().starts_with(path.as_str()) {
                    return false;
                }
                let request = first_values(uri.query().unwrap_or_default());
                params
                    .iter()
                    .all(|(k, v)| request.iter().any(|(rk, rv)| rk == k && rv == v))
            }
            Self::Regex(re) => {
                let target = uri.path_and_query().map_or_else(|| uri.path(), |pq| pq.as_str());
                re.is_match(target)
            }
        }
    }
}

/// First value of every key in a query string, in order.
fn first_values(query: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        if !out.iter().any(|(seen, _)| *seen == k) {
            out.push((k.into_owned(), v.into_owned()));
        }
    }
    out
}

#[derive(Debug)]
struct CompiledRoute {
    route_type: RouteType,
    endpoint: String,
    matcher: Matcher,
    target: RouteTarget,
    apache_vhost: bool,
    unprotected: bool,
}

impl CompiledRoute {
    fn compile(route: &RouteConfig) -> Result<Self, RoutingError> {
        let invalid = |reason: String| RoutingError::InvalidRoute {
            endpoint: route.endpoint.clone(),
            reason,
        };

        let target = match (&route.backend, &route.service) {
            (Some(backend), None) => RouteTarget::Backend(
                Url::parse(backend).map_err(|e| invalid(format!("backend '{backend}': {e}")))?,
            ),
            (None, Some(service)) => RouteTarget::Service(service.clone()),
            _ => return Err(invalid("needs exactly one of backend or service".to_string())),
        };

        let matcher = match route.route_type {
            RouteType::Prefix => Matcher::Prefix(route.endpoint.clone()),
            RouteType::Query => {
                let (path, query) = route
                    .endpoint
                    .split_once('?')
                    .unwrap_or((route.endpoint.as_str(), ""));
                Matcher::Query {
                    path: path.to_string(),
                    params: first_values(query),
                }
            }
            RouteType::Regex => {
                Matcher::Regex(Regex::new(&route.endpoint).map_err(|e| invalid(e.to_string()))?)
            }
        };

        Ok(Self {
            route_type: route.route_type,
            endpoint: route.endpoint.clone(),
            matcher,
            target,
            apache_vhost: route.apache_vhost,
            unprotected: route.unprotected,
        })
    }

    fn info(&self, policy: &str) -> RoutingInfo {
        RoutingInfo {
            policy: policy.to_string(),
            endpoint: self.endpoint.clone(),
            route_type: self.route_type,
            target: self.target.clone(),
            apache_vhost: self.apache_vhost,
            unprotected: self.unprotected,
        }
    }

    fn is_root(&self) -> bool {
        self.route_type == RouteType::Prefix && self.endpoint == "/"
    }
}

/// Routes of one strategy, split by method.
#[derive(Debug, Default)]
struct MethodRoutes {
    by_method: HashMap<String, Vec<CompiledRoute>>,
    any: Vec<CompiledRoute>,
}

impl MethodRoutes {
    fn candidates<'a>(&'a self, method: &Method) -> impl Iterator<Item = &'a CompiledRoute> {
        self.by_method
            .get(method.as_str())
            .into_iter()
            .flatten()
            .chain(self.any.iter())
    }
}

#[derive(Debug, Default)]
struct PolicyRoutes {
    by_type: HashMap<RouteType, MethodRoutes>,
    root_by_method: HashMap<String, CompiledRoute>,
    root_any: Option<CompiledRoute>,
}

/// Policy-based router
#[derive(Debug)]
pub struct Router {
    policies: HashMap<String, PolicyRoutes>,
    selector: PolicySelector,
}

impl Router {
    /// Build the route table for every policy.
    pub fn new(policies: &[PolicyConfig], selector: PolicySelector) -> Result<Self, RoutingError> {
        let mut router = Self {
            policies: HashMap::new(),
            selector,
        };
        for policy in policies {
            router.policies.entry(policy.name.clone()).or_default();
            for route in &policy.routes {
                router.add_route(&policy.name, route)?;
            }
        }
        Ok(router)
    }

    /// Register a route under `policy`.
    pub fn add_route(&mut self, policy: &str, route: &RouteConfig) -> Result<(), RoutingError> {
        let compiled = CompiledRoute::compile(route)?;
        let method = route
            .method
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(str::to_ascii_uppercase);
        let table = self.policies.entry(policy.to_string()).or_default();

        if compiled.is_root() {
            match method {
                Some(m) => {
                    table.root_by_method.entry(m).or_insert(compiled);
                }
                None => {
                    if table.root_any.is_none() {
                        table.root_any = Some(compiled);
                    }
                }
            }
            return Ok(());
        }

        debug!(policy = %policy, route_type = %route.route_type, endpoint = %route.endpoint, "Added route");
        let routes = table.by_type.entry(route.route_type).or_default();
        match method {
            Some(m) => routes.by_method.entry(m).or_default().push(compiled),
            None => routes.any.push(compiled),
        }
        Ok(())
    }

    /// The policy selector.
    pub fn selector(&self) -> &PolicySelector {
        &self.selector
    }

    /// Whether `name` is a configured policy.
    pub fn has_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Select the policy and resolve the route for a request.
    pub fn route(&self, parts: &Parts, identity: &Identity) -> Result<RoutingInfo, RoutingError> {
        let policy = self.selector.select(parts, identity)?;
        self.route_in_policy(&policy, &parts.method, &parts.uri)
    }

    /// Resolve the route inside a known policy.
    pub fn route_in_policy(
        &self,
        policy: &str,
        method: &Method,
        uri: &Uri,
    ) -> Result<RoutingInfo, RoutingError> {
        let table = self
            .policies
            .get(policy)
            .ok_or_else(|| RoutingError::UnknownPolicy(policy.to_string()))?;

        for route_type in RouteType::PRECEDENCE {
            let Some(routes) = table.by_type.get(&route_type) else {
                continue;
            };
            if let Some(route) = routes.candidates(method).find(|r| r.matcher.matches(uri)) {
                return Ok(route.info(policy));
            }
        }

        if let Some(root) = table
            .root_by_method
            .get(method.as_str())
            .or(table.root_any.as_ref())
        {
            return Ok(root.info(policy));
        }

        warn!(policy = %policy, method = %method, path = %uri.path(), "No route found");
        Err(RoutingError::NoRoute {
            policy: policy.to_string(),
            method: method.to_string(),
            path: uri.path().to_string(),
        })
    }

    /// Policy names with their route counts.
    pub fn summary(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self
            .policies
            .iter()
            .map(|(name, table)| {
                let routes: usize = table
                    .by_type
                    .values()
                    .map(|r| r.any.len() + r.by_method.values().map(Vec::len).sum::<usize>())
                    .sum();
                let roots = table.root_by_method.len() + usize::from(table.root_any.is_some());
                (name.clone(), routes + roots)
            })
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(route_type: RouteType, method: Option<&str>, endpoint: &str, backend: &str) -> RouteConfig {
        RouteConfig {
            route_type,
            method: method.map(str::to_string),
            endpoint: endpoint.to_string(),
            backend: Some(backend.to_string()),
            ..Default::default()
        }
    }

    fn router(routes: Vec<RouteConfig>) -> Router {
        let policies = vec![PolicyConfig {
            name: "ocis".to_string(),
            routes,
        }];
        let selector = PolicySelector::from_config(None, &policies).unwrap();
        Router::new(&policies, selector).unwrap()
    }

    fn resolve(r: &Router, method: Method, uri: &str) -> Result<RoutingInfo, RoutingError> {
        r.route_in_policy("ocis", &method, &uri.parse().unwrap())
    }

    fn backend_of(info: &RoutingInfo) -> String {
        match &info.target {
            RouteTarget::Backend(url) => url.to_string(),
            RouteTarget::Service(s) => s.clone(),
        }
    }

    #[test]
    fn test_precedence_query_regex_prefix() {
        let r = router(vec![
            route(RouteType::Prefix, None, "/remote.php/", "http://prefix/"),
            route(RouteType::Regex, None, "^/remote\\.php/.*preview", "http://regex/"),
            route(RouteType::Query, None, "/remote.php/?preview=1", "http://query/"),
        ]);

        let info = resolve(&r, Method::GET, "/remote.php/file.jpg?preview=1").unwrap();
        assert_eq!(backend_of(&info), "http://query/");
        assert_eq!(info.route_type, RouteType::Query);

        let info = resolve(&r, Method::GET, "/remote.php/file.jpg?preview=0").unwrap();
        assert_eq!(backend_of(&info), "http://regex/");

        let info = resolve(&r, Method::GET, "/remote.php/file.jpg").unwrap();
        assert_eq!(backend_of(&info), "http://prefix/");
    }

    #[test]
    fn test_query_uses_first_values() {
        let r = router(vec![route(RouteType::Query, None, "/app/?a=1&b=2", "http://query/")]);
        assert!(resolve(&r, Method::GET, "/app/x?b=2&a=1&a=9").is_ok());
        assert!(resolve(&r, Method::GET, "/app/x?a=9&a=1&b=2").is_err());
        assert!(resolve(&r, Method::GET, "/app/x?a=1").is_err());
    }

    #[test]
    fn test_query_route_on_root_path() {
        let r = router(vec![
            route(RouteType::Query, None, "/?preview=1", "http://thumbs/"),
            route(RouteType::Query, None, "/", "http://never/"),
            route(RouteType::Prefix, None, "/", "http://root/"),
        ]);

        let info = resolve(&r, Method::GET, "/files/a.png?preview=1").unwrap();
        assert_eq!(backend_of(&info), "http://thumbs/");
        assert_eq!(info.route_type, RouteType::Query);

        let info = resolve(&r, Method::GET, "/files/a.png").unwrap();
        assert_eq!(backend_of(&info), "http://root/");
        assert_eq!(info.route_type, RouteType::Prefix);
    }

    #[test]
    fn test_method_specific_routes_win() {
        let r = router(vec![
            route(RouteType::Prefix, None, "/data", "http://any/"),
            route(RouteType::Prefix, Some("post"), "/data", "http://post/"),
        ]);
        assert_eq!(backend_of(&resolve(&r, Method::POST, "/data/x").unwrap()), "http://post/");
        assert_eq!(backend_of(&resolve(&r, Method::GET, "/data/x").unwrap()), "http://any/");
    }

    #[test]
    fn test_root_fallback_method_first() {
        let r = router(vec![
            route(RouteType::Prefix, None, "/", "http://root/"),
            route(RouteType::Prefix, Some("PUT"), "/", "http://root-put/"),
        ]);
        assert_eq!(backend_of(&resolve(&r, Method::GET, "/anything").unwrap()), "http://root/");
        assert_eq!(backend_of(&resolve(&r, Method::PUT, "/anything").unwrap()), "http://root-put/");
    }

    #[test]
    fn test_prefix_slash_only_matches_as_root() {
        let r = router(vec![route(RouteType::Prefix, Some("GET"), "/", "http://root-get/")]);
        assert!(resolve(&r, Method::GET, "/x").is_ok());
        assert!(matches!(
            resolve(&r, Method::POST, "/x"),
            Err(RoutingError::NoRoute { .. })
        ));
    }

    #[test]
    fn test_no_root_is_no_route() {
        let r = router(vec![route(RouteType::Prefix, None, "/api", "http://api/")]);
        assert!(matches!(
            resolve(&r, Method::GET, "/other"),
            Err(RoutingError::NoRoute { .. })
        ));
    }

    #[test]
    fn test_unknown_policy() {
        let r = router(vec![]);
        assert!(matches!(
            r.route_in_policy("oc10", &Method::GET, &"/".parse().unwrap()),
            Err(RoutingError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_invalid_routes_rejected() {
        let policies = vec![PolicyConfig {
            name: "ocis".to_string(),
            routes: vec![route(RouteType::Regex, None, "(", "http://x/")],
        }];
        let selector = PolicySelector::from_config(None, &policies).unwrap();
        assert!(matches!(
            Router::new(&policies, selector),
            Err(RoutingError::InvalidRoute { .. })
        ));

        let mut r = router(vec![]);
        let both = RouteConfig {
            endpoint: "/x".to_string(),
            backend: Some("http://x/".to_string()),
            service: Some("x".to_string()),
            ..Default::default()
        };
        assert!(r.add_route("ocis", &both).is_err());
    }

    #[test]
    fn test_route_flags_carried() {
        let mut open = route(RouteType::Prefix, None, "/signin/", "http://idp/");
        open.unprotected = true;
        open.apache_vhost = true;
        let r = router(vec![open]);
        let info = resolve(&r, Method::GET, "/signin/v1/identifier").unwrap();
        assert!(info.unprotected);
        assert!(info.apache_vhost);
        assert_eq!(info.policy, "ocis");
        assert_eq!(r.summary(), vec![("ocis".to_string(), 1)]);
    }
}
