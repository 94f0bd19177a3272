//! Public link authentication
//!
//! The share token comes from the `public-token` header or query parameter.
//! A link is opened either with its password (basic auth as user `public`)
//! or with a `signature` and `expiration` pair minted for the link.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::request::Parts;
use tracing::debug;

use super::{Authenticated, Authenticator, basic_credentials, query_param};
use crate::identity::{CredentialKind, UserBackend};

/// Header and query parameter carrying the share token.
const PUBLIC_TOKEN: &str = "public-token";

/// Basic auth login used for share passwords.
const PUBLIC_LOGIN: &str = "public";

/// Authenticates public link access.
pub struct PublicShareAuthenticator {
    users: Arc<dyn UserBackend>,
}

impl PublicShareAuthenticator {
    /// Create the authenticator.
    pub fn new(users: Arc<dyn UserBackend>) -> Self {
        Self { users }
    }

    fn share_secret(request: &Parts) -> Option<String> {
        if let Some(signature) = query_param(request, "signature") {
            let expiration = query_param(request, "expiration")?;
            return Some(format!("signature|{signature}|{expiration}"));
        }
        match basic_credentials(&request.headers) {
            Some((login, password)) if login == PUBLIC_LOGIN => Some(format!("password|{password}")),
            Some(_) => None,
            None => Some("password|".to_string()),
        }
    }
}

#[async_trait]
impl Authenticator for PublicShareAuthenticator {
    fn name(&self) -> &'static str {
        "public_share"
    }

    async fn authenticate(&self, request: &Parts) -> Option<Authenticated> {
        let token = request
            .headers
            .get(PUBLIC_TOKEN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query_param(request, PUBLIC_TOKEN))
            .filter(|t| !t.is_empty())?;
        let secret = Self::share_secret(request)?;

        match self
            .users
            .authenticate(CredentialKind::PublicShare, &token, &secret)
            .await
        {
            Ok(session) => Some(Authenticated {
                authenticator: "public_share",
                claims: None,
                user: None,
                access_token: Some(session.token),
            }),
            Err(e) => {
                debug!(authenticator = "public_share", path = %request.uri.path(), error = %e, "Public link rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoProvisionClaims, DirectoryConfig, PublicShareConfig};
    use crate::identity::InMemoryUserBackend;
    use crate::identity::memory::sign_share_link;
    use axum::http::{Request, header};

    fn authenticator() -> PublicShareAuthenticator {
        let directory = DirectoryConfig {
            public_shares: vec![
                PublicShareConfig {
                    token: "locked".to_string(),
                    password: Some("s3cret".to_string()),
                    signing_secret: Some("link-secret".to_string()),
                },
                PublicShareConfig {
                    token: "open".to_string(),
                    password: None,
                    signing_secret: None,
                },
            ],
            ..Default::default()
        };
        PublicShareAuthenticator::new(Arc::new(InMemoryUserBackend::from_config(
            &directory,
            AutoProvisionClaims::default(),
            "",
        )))
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_password_via_basic_public_user() {
        let auth = authenticator();
        // public:s3cret
        let ok = request(
            "/dav/public-files/locked",
            &[("public-token", "locked"), (header::AUTHORIZATION.as_str(), "Basic cHVibGljOnMzY3JldA==")],
        );
        let out = auth.authenticate(&ok).await.unwrap();
        assert!(out.user.is_none());
        assert!(out.access_token.is_some());

        // alice:s3cret
        let wrong_user = request(
            "/dav/public-files/locked",
            &[("public-token", "locked"), (header::AUTHORIZATION.as_str(), "Basic YWxpY2U6czNjcmV0")],
        );
        assert!(auth.authenticate(&wrong_user).await.is_none());

        let no_password = request("/dav/public-files/locked", &[("public-token", "locked")]);
        assert!(auth.authenticate(&no_password).await.is_none());
    }

    #[tokio::test]
    async fn test_open_share_from_query_token() {
        let auth = authenticator();
        assert!(auth
            .authenticate(&request("/dav/public-files/open?public-token=open", &[]))
            .await
            .is_some());
        assert!(auth.authenticate(&request("/dav/public-files/open", &[])).await.is_none());
    }

    #[tokio::test]
    async fn test_signature_requires_expiration() {
        let auth = authenticator();
        let expiration = (chrono::Utc::now() + chrono::Duration::minutes(5)).to_rfc3339();
        let signature = sign_share_link("link-secret", "locked", &expiration);
        let query = serde_urlencoded::to_string([
            ("public-token", "locked"),
            ("signature", signature.as_str()),
            ("expiration", expiration.as_str()),
        ])
        .unwrap();

        let out = auth
            .authenticate(&request(&format!("/dav/public-files/locked?{query}"), &[]))
            .await;
        assert!(out.is_some());

        let missing = format!("/dav/public-files/locked?public-token=locked&signature={signature}");
        assert!(auth.authenticate(&request(&missing, &[])).await.is_none());
    }
}
