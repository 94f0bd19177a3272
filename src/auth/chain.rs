//! Authenticator chain and 401 challenges

use std::sync::Arc;

use axum::http::{Method, header, request::Parts};
use tracing::{debug, info};

use super::paths::{PathRules, TOKEN_ENDPOINT};
use super::{Authenticated, Authenticator, client_addr};
use crate::config::{ChallengeScheme, Config};

/// Result of running the chain for one request.
#[derive(Debug)]
pub enum ChainOutcome {
    /// Authentication not required; continue anonymously.
    Exempt,
    /// An authenticator vouched for the request.
    Authenticated(Authenticated),
    /// Everyone declined; answer 401 with these `WWW-Authenticate` values.
    Rejected(Vec<String>),
}

/// Ordered authenticators plus the exemption and challenge rules.
pub struct AuthenticationChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
    paths: Arc<PathRules>,
    schemes: Vec<ChallengeScheme>,
    by_user_agent: Vec<(String, ChallengeScheme)>,
}

impl AuthenticationChain {
    /// Create a chain. Challenge schemes follow the enabled strategies.
    pub fn new(
        authenticators: Vec<Arc<dyn Authenticator>>,
        paths: Arc<PathRules>,
        config: &Config,
    ) -> Self {
        let mut schemes = Vec::new();
        if config.auth.enable_basic_auth {
            schemes.push(ChallengeScheme::Basic);
        }
        if config.oidc.enabled() {
            schemes.push(ChallengeScheme::Bearer);
        }

        // Longest agent key first so overlapping keys resolve the same way every time
        let mut by_user_agent: Vec<(String, ChallengeScheme)> = config
            .auth
            .credentials_by_user_agent
            .iter()
            .map(|(agent, scheme)| (agent.clone(), *scheme))
            .collect();
        by_user_agent.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            authenticators,
            paths,
            schemes,
            by_user_agent,
        }
    }

    /// Names of the authenticators, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.authenticators.iter().map(|a| a.name()).collect()
    }

    /// Path tables in use.
    pub fn paths(&self) -> &PathRules {
        &self.paths
    }

    /// Run the chain. `route_unprotected` comes from the preliminary route lookup.
    pub async fn authenticate(&self, request: &Parts, route_unprotected: bool) -> ChainOutcome {
        let path = request.uri.path();
        if self.is_exempt(request, route_unprotected) {
            debug!(path = %path, "Authentication not required");
            return ChainOutcome::Exempt;
        }

        for authenticator in &self.authenticators {
            if let Some(authenticated) = authenticator.authenticate(request).await {
                debug!(path = %path, authenticator = authenticator.name(), "Request authenticated");
                return ChainOutcome::Authenticated(authenticated);
            }
        }

        if self.paths.is_public(path) {
            debug!(path = %path, "Public path, continuing anonymously");
            return ChainOutcome::Exempt;
        }

        info!(path = %path, client = %client_addr(request), "Unauthenticated request");
        ChainOutcome::Rejected(self.challenges(request))
    }

    fn is_exempt(&self, request: &Parts, route_unprotected: bool) -> bool {
        let path = request.uri.path();
        path == TOKEN_ENDPOINT
            || request.method == Method::OPTIONS
            || route_unprotected
            || self.paths.is_unprotected(path)
    }

    /// `WWW-Authenticate` values for a rejected request.
    pub fn challenges(&self, request: &Parts) -> Vec<String> {
        let host = request
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri.host())
            .unwrap_or_default();
        let user_agent = request
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        let challenge =
            |scheme: ChallengeScheme| format!(r#"{} realm="{host}", charset="UTF-8""#, scheme.as_str());

        if let Some((_, scheme)) = self
            .by_user_agent
            .iter()
            .find(|(agent, _)| !agent.is_empty() && user_agent.contains(agent.as_str()))
        {
            return vec![challenge(*scheme)];
        }
        self.schemes.iter().copied().map(challenge).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::http::Request;
    use pretty_assertions::assert_eq;

    struct Counting {
        name: &'static str,
        succeed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn authenticate(&self, _request: &Parts) -> Option<Authenticated> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.succeed.then(|| Authenticated {
                authenticator: self.name,
                access_token: Some("t".to_string()),
                ..Default::default()
            })
        }
    }

    fn counting(name: &'static str, succeed: bool) -> Arc<Counting> {
        Arc::new(Counting {
            name,
            succeed,
            calls: AtomicUsize::new(0),
        })
    }

    fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(path);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.auth.enable_basic_auth = true;
        config.oidc.issuer = "https://idp.example.com".to_string();
        config
    }

    fn chain(auths: &[Arc<Counting>], config: &Config) -> AuthenticationChain {
        let list: Vec<Arc<dyn Authenticator>> = auths
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn Authenticator>)
            .collect();
        AuthenticationChain::new(list, Arc::new(PathRules::from_config(&config.auth)), config)
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let a = counting("a", false);
        let b = counting("b", true);
        let c = counting("c", true);
        let chain = chain(&[Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)], &config());

        let outcome = chain.authenticate(&request(Method::GET, "/graph/v1.0/me", &[]), false).await;
        match outcome {
            ChainOutcome::Authenticated(auth) => assert_eq!(auth.authenticator, "b"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exemptions_skip_every_authenticator() {
        let a = counting("a", true);
        let chain = chain(&[Arc::clone(&a)], &config());

        for (method, path, unprotected) in [
            (Method::GET, "/konnect/v1/token", false),
            (Method::OPTIONS, "/remote.php/webdav", false),
            (Method::GET, "/remote.php/webdav", true),
            (Method::GET, "/status.php", false),
            (Method::GET, "/themes/owncloud/theme.json", false),
        ] {
            let outcome = chain.authenticate(&request(method, path, &[]), unprotected).await;
            assert!(matches!(outcome, ChainOutcome::Exempt), "{path}");
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_public_path_passes_after_failure() {
        let a = counting("a", false);
        let chain = chain(&[Arc::clone(&a)], &config());
        let outcome = chain
            .authenticate(&request(Method::GET, "/remote.php/dav/public-files/tok", &[]), false)
            .await;
        assert!(matches!(outcome, ChainOutcome::Exempt));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_lists_configured_challenges() {
        let chain = chain(&[counting("a", false)], &config());
        let outcome = chain
            .authenticate(&request(Method::GET, "/graph", &[("host", "cloud.example.com")]), false)
            .await;
        let ChainOutcome::Rejected(challenges) = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(
            challenges,
            vec![
                r#"Basic realm="cloud.example.com", charset="UTF-8""#.to_string(),
                r#"Bearer realm="cloud.example.com", charset="UTF-8""#.to_string(),
            ]
        );
    }

    #[test]
    fn test_user_agent_override() {
        let mut config = config();
        config
            .auth
            .credentials_by_user_agent
            .insert("mirall".to_string(), ChallengeScheme::Basic);
        config
            .auth
            .credentials_by_user_agent
            .insert("Mozilla/5.0 (Android".to_string(), ChallengeScheme::Bearer);
        let chain = chain(&[], &config);

        let challenges = chain.challenges(&request(
            Method::GET,
            "/",
            &[("host", "h"), ("user-agent", "Mozilla/5.0 (Linux) mirall/2.10")],
        ));
        assert_eq!(challenges, vec![r#"Basic realm="h", charset="UTF-8""#.to_string()]);

        // substring match is case sensitive
        let challenges = chain.challenges(&request(
            Method::GET,
            "/",
            &[("host", "h"), ("user-agent", "Mirall/2.10")],
        ));
        assert_eq!(challenges.len(), 2);
    }

    #[test]
    fn test_no_strategies_means_no_challenges() {
        let chain = chain(&[], &Config::default());
        assert!(chain.challenges(&request(Method::GET, "/", &[])).is_empty());
    }
}
