//! Bearer token authentication against the OIDC provider

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::request::Parts;
use tracing::{debug, info};

use super::paths::PathRules;
use super::{Authenticated, Authenticator, bearer_token, client_addr};
use crate::config::OidcConfig;
use crate::oidc::{ClaimsCache, OidcClient};

/// Paths the provider itself serves with bearer tokens.
const SKIPPED_PATHS: [&str; 2] = ["/konnect/v1/userinfo", "/status.php"];

/// Verifies bearer tokens and caches the resulting claims.
pub struct OidcAuthenticator {
    client: Arc<OidcClient>,
    cache: Arc<ClaimsCache>,
    paths: Arc<PathRules>,
    skip_user_info: bool,
    user_info_ttl: Duration,
}

impl OidcAuthenticator {
    /// Create the authenticator.
    pub fn new(
        client: Arc<OidcClient>,
        cache: Arc<ClaimsCache>,
        paths: Arc<PathRules>,
        config: &OidcConfig,
    ) -> Self {
        Self {
            client,
            cache,
            paths,
            skip_user_info: config.skip_user_info,
            user_info_ttl: config.user_info_cache.ttl,
        }
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn name(&self) -> &'static str {
        "oidc"
    }

    async fn authenticate(&self, request: &Parts) -> Option<Authenticated> {
        let path = request.uri.path();
        if self.client.issuer().is_empty()
            || self.paths.is_public(path)
            || SKIPPED_PATHS.contains(&path)
        {
            return None;
        }
        let token = bearer_token(&request.headers)?;

        if let Some(claims) = self.cache.get(token) {
            debug!(path = %path, authenticator = "oidc", "Claims served from cache");
            return Some(Authenticated {
                authenticator: "oidc",
                claims: Some(claims),
                ..Default::default()
            });
        }

        let verified = match self.client.verify_access_token(token).await {
            Ok(v) => v,
            Err(e) => {
                info!(
                    authenticator = "oidc",
                    path = %path,
                    client = %client_addr(request),
                    error = %e,
                    "Failed to verify access token"
                );
                return None;
            }
        };

        let claims = if self.skip_user_info {
            verified.claims.clone()
        } else {
            match self.client.userinfo(token).await {
                Ok(claims) => claims,
                Err(e) => {
                    info!(
                        authenticator = "oidc",
                        path = %path,
                        client = %client_addr(request),
                        error = %e,
                        "Failed to fetch userinfo"
                    );
                    return None;
                }
            }
        };

        let expires_at = verified
            .expires_at
            .and_then(|exp| u64::try_from(exp).ok())
            .map_or_else(
                || SystemTime::now() + self.user_info_ttl,
                |exp| UNIX_EPOCH + Duration::from_secs(exp),
            );
        let session_id = verified
            .claims
            .session_id()
            .or_else(|| claims.session_id())
            .map(str::to_string);
        self.cache
            .insert_for_session(token, claims.clone(), expires_at, session_id);

        debug!(path = %path, authenticator = "oidc", "Access token verified");
        Some(Authenticated {
            authenticator: "oidc",
            claims: Some(claims),
            ..Default::default()
        })
    }
}
