//! Client API key authentication
//!
//! Keys arrive in `X-API-Key` or `Authorization: ApiKey <key>` and act as
//! the configured user. Each key may carry a per-minute rate limit.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, header, request::Parts};
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::{Authenticated, Authenticator, client_addr};
use crate::config::ApiKeyConfig;
use crate::identity::UserBackend;

type ClientRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Header carrying the key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// A key with env references expanded.
#[derive(Debug, Clone)]
struct ResolvedApiKey {
    key: String,
    name: String,
    username: String,
}

/// Authenticates machine clients by static key.
pub struct ClientApiKeyAuthenticator {
    users: Arc<dyn UserBackend>,
    keys: Vec<ResolvedApiKey>,
    rate_limiters: DashMap<String, Arc<ClientRateLimiter>>,
}

impl ClientApiKeyAuthenticator {
    /// Create the authenticator from configured keys.
    pub fn new(users: Arc<dyn UserBackend>, config: &[ApiKeyConfig]) -> Self {
        let mut keys = Vec::with_capacity(config.len());
        let rate_limiters = DashMap::new();
        for k in config {
            let resolved = ResolvedApiKey {
                key: k.resolve_key(),
                name: if k.name.is_empty() {
                    k.username.clone()
                } else {
                    k.name.clone()
                },
                username: k.username.clone(),
            };
            if resolved.key.is_empty() {
                warn!(client = %resolved.name, "Ignoring API key with empty value");
                continue;
            }
            if let Some(quota) = NonZeroU32::new(k.rate_limit) {
                let limiter = RateLimiter::direct(Quota::per_minute(quota));
                rate_limiters.insert(resolved.name.clone(), Arc::new(limiter));
            }
            keys.push(resolved);
        }

        Self {
            users,
            keys,
            rate_limiters,
        }
    }

    fn presented_key(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("ApiKey "))
            })
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    fn find(&self, presented: &str) -> Option<&ResolvedApiKey> {
        self.keys.iter().find(|k| {
            k.key.len() == presented.len() && bool::from(k.key.as_bytes().ct_eq(presented.as_bytes()))
        })
    }

    /// Returns true if allowed, false if rate limited.
    fn check_rate_limit(&self, client_name: &str) -> bool {
        self.rate_limiters
            .get(client_name)
            .is_none_or(|limiter| limiter.check().is_ok())
    }
}

#[async_trait]
impl Authenticator for ClientApiKeyAuthenticator {
    fn name(&self) -> &'static str {
        "api_key"
    }

    async fn authenticate(&self, request: &Parts) -> Option<Authenticated> {
        let presented = Self::presented_key(&request.headers)?;
        let Some(key) = self.find(presented) else {
            debug!(path = %request.uri.path(), client = %client_addr(request), "Unknown API key");
            return None;
        };

        if !self.check_rate_limit(&key.name) {
            warn!(client = %key.name, path = %request.uri.path(), "API key rate limited");
            return None;
        }

        match self.users.get_user_by_claims("username", &key.username).await {
            Ok((user, token)) => Some(Authenticated {
                authenticator: "api_key",
                claims: None,
                user: Some(user),
                access_token: Some(token),
            }),
            Err(e) => {
                warn!(client = %key.name, username = %key.username, error = %e, "API key user unavailable");
                None
            }
        }
    }
}
