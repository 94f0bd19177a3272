//! Pluggable authentication
//!
//! Each [`Authenticator`] inspects the request and either vouches for it or
//! declines. Declining never aborts the chain; the [`AuthenticationChain`]
//! moves on to the next authenticator and only rejects the request once all
//! of them have declined.

pub mod api_key;
pub mod app_auth;
pub mod basic;
pub mod chain;
pub mod oidc;
pub mod paths;
pub mod public_share;
pub mod signed_url;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, header, request::Parts};
use base64::Engine;
use tracing::warn;

use crate::claims::Claims;
use crate::config::Config;
use crate::identity::{SigningKeyStore, User, UserBackend};
use crate::oidc::{ClaimsCache, OidcClient};

pub use api_key::ClientApiKeyAuthenticator;
pub use app_auth::AppAuthAuthenticator;
pub use basic::BasicAuthenticator;
pub use chain::{AuthenticationChain, ChainOutcome};
pub use oidc::OidcAuthenticator;
pub use paths::PathRules;
pub use public_share::PublicShareAuthenticator;
pub use signed_url::SignedUrlAuthenticator;

/// What a successful authenticator hands to identity resolution.
#[derive(Debug, Clone, Default)]
pub struct Authenticated {
    /// Name of the authenticator that succeeded.
    pub authenticator: &'static str,
    /// Claims, when the credential carried any.
    pub claims: Option<Claims>,
    /// Pre-resolved user
    pub user: Option<User>,
    /// Token for the backend.
    pub access_token: Option<String>,
}

/// One way of authenticating a request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Vouch for the request, or decline with `None`.
    async fn authenticate(&self, request: &Parts) -> Option<Authenticated>;
}

/// Collaborators the authenticators need.
#[derive(Clone)]
pub struct ChainDeps {
    /// User directory
    pub users: Arc<dyn UserBackend>,
    /// Signing keys for signed URLs.
    pub signing_keys: Arc<dyn SigningKeyStore>,
    /// OIDC provider client, when an issuer is configured.
    pub oidc: Option<Arc<OidcClient>>,
    /// Token to claims cache.
    pub claims_cache: Arc<ClaimsCache>,
}

/// Instantiate the configured authenticators in chain order.
pub fn build_chain(config: &Config, deps: &ChainDeps) -> AuthenticationChain {
    let paths = Arc::new(PathRules::from_config(&config.auth));
    let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::new();

    if config.auth.enable_basic_auth {
        warn!("Basic auth is enabled. Use it for testing and development only");
        authenticators.push(Arc::new(BasicAuthenticator::new(
            Arc::clone(&deps.users),
            Arc::clone(&paths),
            &config.identity,
        )));
    }
    if config.auth.enable_app_auth {
        authenticators.push(Arc::new(AppAuthAuthenticator::new(Arc::clone(&deps.users))));
    }
    authenticators.push(Arc::new(PublicShareAuthenticator::new(Arc::clone(&deps.users))));
    if let Some(client) = &deps.oidc {
        authenticators.push(Arc::new(OidcAuthenticator::new(
            Arc::clone(client),
            Arc::clone(&deps.claims_cache),
            Arc::clone(&paths),
            &config.oidc,
        )));
    }
    if config.pre_signed_url.enabled {
        authenticators.push(Arc::new(SignedUrlAuthenticator::new(
            Arc::clone(&deps.users),
            Arc::clone(&deps.signing_keys),
            &config.pre_signed_url,
            &config.server.public_scheme,
        )));
    }
    if !config.auth.api_keys.is_empty() {
        authenticators.push(Arc::new(ClientApiKeyAuthenticator::new(
            Arc::clone(&deps.users),
            &config.auth.api_keys,
        )));
    }

    AuthenticationChain::new(authenticators, paths, config)
}

/// Token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Login and password from `Authorization: Basic <base64>`.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (login, password) = decoded.split_once(':')?;
    Some((login.to_string(), password.to_string()))
}

/// First value of a query parameter.
pub fn query_param(request: &Parts, name: &str) -> Option<String> {
    let query = request.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Peer address for logs, when the server recorded it.
pub fn client_addr(request: &Parts) -> String {
    request
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.to_string())
}
