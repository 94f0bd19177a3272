//! Password authentication over `Authorization: Basic`

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use tracing::info;

use super::paths::PathRules;
use super::{Authenticated, Authenticator, basic_credentials, client_addr};
use crate::claims::{Claims, OWNCLOUD_UUID_CLAIM};
use crate::config::IdentityConfig;
use crate::identity::{CredentialKind, UserBackend};

/// Checks account passwords and turns the user into claims.
pub struct BasicAuthenticator {
    users: Arc<dyn UserBackend>,
    paths: Arc<PathRules>,
    user_oidc_claim: String,
    user_cs3_claim: String,
}

impl BasicAuthenticator {
    /// Create the authenticator.
    pub fn new(users: Arc<dyn UserBackend>, paths: Arc<PathRules>, identity: &IdentityConfig) -> Self {
        Self {
            users,
            paths,
            user_oidc_claim: identity.user_oidc_claim.clone(),
            user_cs3_claim: identity.user_cs3_claim.clone(),
        }
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    fn name(&self) -> &'static str {
        "basic"
    }

    async fn authenticate(&self, request: &Parts) -> Option<Authenticated> {
        if self.paths.is_public(request.uri.path()) {
            return None;
        }
        let (login, password) = basic_credentials(&request.headers)?;

        let session = match self
            .users
            .authenticate(CredentialKind::Password, &login, &password)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                info!(
                    authenticator = "basic",
                    path = %request.uri.path(),
                    client = %client_addr(request),
                    error = %e,
                    "Failed to authenticate"
                );
                return None;
            }
        };
        let user = session.user?;

        let mut claims = Claims::new();
        claims.insert("iss", user.idp.clone());
        claims.insert("preferred_username", user.username.clone());
        claims.insert("email", user.mail.clone());
        claims.insert(OWNCLOUD_UUID_CLAIM, user.id.clone());
        if self.user_cs3_claim == "userid" {
            // The resolver looks the user up by id in this mode
            claims.insert(self.user_oidc_claim.clone(), user.id.clone());
        }

        Some(Authenticated {
            authenticator: "basic",
            claims: Some(claims),
            ..Default::default()
        })
    }
}
