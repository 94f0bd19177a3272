//! App password authentication

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use tracing::debug;

use super::{Authenticated, Authenticator, basic_credentials};
use crate::identity::{CredentialKind, UserBackend};

/// Accepts app passwords sent as basic credentials.
pub struct AppAuthAuthenticator {
    users: Arc<dyn UserBackend>,
}

impl AppAuthAuthenticator {
    /// Create the authenticator.
    pub fn new(users: Arc<dyn UserBackend>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Authenticator for AppAuthAuthenticator {
    fn name(&self) -> &'static str {
        "app_auth"
    }

    async fn authenticate(&self, request: &Parts) -> Option<Authenticated> {
        let (login, password) = basic_credentials(&request.headers)?;
        match self
            .users
            .authenticate(CredentialKind::AppPassword, &login, &password)
            .await
        {
            Ok(session) => {
                let user = session.user?;
                Some(Authenticated {
                    authenticator: "app_auth",
                    claims: None,
                    user: Some(user),
                    access_token: Some(session.token),
                })
            }
            Err(e) => {
                debug!(authenticator = "app_auth", path = %request.uri.path(), error = %e, "App password rejected");
                None
            }
        }
    }
}
