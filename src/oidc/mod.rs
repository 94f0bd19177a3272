//! OIDC provider client.
//!
//! # Verification flow
//!
//! 1. Discover the provider (`<issuer>/.well-known/openid-configuration`) on
//!    first use and start the key set refresher.
//! 2. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 3. Look the key up in the [`KeySetCache`].
//! 4. Verify the signature, `exp`/`nbf` (60 s leeway) and `iss`. The
//!    discovered `access_token_issuer` takes precedence over `issuer` when a
//!    provider publishes one.
//!
//! With `access_token_verify_method: none` the access token is treated as
//! opaque and only the userinfo endpoint vouches for it.

pub mod cache;
pub mod jwks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, Header, Validation};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use cache::ClaimsCache;
pub use jwks::KeySetCache;

use crate::claims::Claims;
use crate::config::{AccessTokenVerifyMethod, JwksConfig, OidcConfig};

/// Event member required in back-channel logout tokens.
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Error variants for OIDC failures.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// JWT decode / signature verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` is not in the provider's key set.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Token signed with an algorithm we do not accept.
    #[error("Unsupported signing algorithm: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    /// Network or HTTP status error talking to the provider.
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Discovery document unusable.
    #[error("Provider discovery failed: {0}")]
    Discovery(String),

    /// Userinfo response unusable.
    #[error("Invalid userinfo response: {0}")]
    UserInfo(String),

    /// Logout token failed a structural check.
    #[error("Invalid logout token: {0}")]
    LogoutToken(String),
}

/// Subset of the discovery document we rely on.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// Key set location.
    pub jwks_uri: String,
    /// Userinfo endpoint
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    /// AD FS style issuer for access tokens.
    #[serde(default)]
    pub access_token_issuer: Option<String>,
}

struct Provider {
    metadata: ProviderMetadata,
    keys: Arc<KeySetCache>,
}

/// Claims of a verified access token.
#[derive(Debug, Clone, Default)]
pub struct VerifiedAccessToken {
    /// Token claims; empty when verification is disabled.
    pub claims: Claims,
    /// `exp` in unix seconds, when known.
    pub expires_at: Option<i64>,
}

/// A verified back-channel logout token.
#[derive(Debug, Clone)]
pub struct LogoutToken {
    /// Issuer
    pub issuer: String,
    /// Subject, if present.
    pub subject: Option<String>,
    /// Session id, if present.
    pub session_id: Option<String>,
}

/// Client for one OIDC provider.
pub struct OidcClient {
    issuer: String,
    verify_method: AccessTokenVerifyMethod,
    jwks_options: JwksConfig,
    http: reqwest::Client,
    provider: OnceCell<Provider>,
    shutdown: CancellationToken,
}

impl OidcClient {
    /// Create a client. Discovery happens lazily on first use.
    pub fn new(config: &OidcConfig, shutdown: CancellationToken) -> Result<Self, OidcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        Ok(Self::with_http_client(config, http, shutdown))
    }

    /// Create a client around an existing HTTP client.
    pub fn with_http_client(
        config: &OidcConfig,
        http: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            issuer: config.issuer.clone(),
            verify_method: config.access_token_verify_method,
            jwks_options: config.jwks.clone(),
            http,
            provider: OnceCell::new(),
            shutdown,
        }
    }

    /// Configured issuer
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Discovery document URL.
    pub fn discovery_url(&self) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            self.issuer.trim_end_matches('/')
        )
    }

    /// Provider metadata, discovering it if needed.
    pub async fn metadata(&self) -> Result<&ProviderMetadata, OidcError> {
        Ok(&self.provider().await?.metadata)
    }

    async fn provider(&self) -> Result<&Provider, OidcError> {
        self.provider
            .get_or_try_init(|| async {
                let metadata: ProviderMetadata = self
                    .http
                    .get(self.discovery_url())
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                if metadata.jwks_uri.is_empty() {
                    return Err(OidcError::Discovery("jwks_uri is empty".to_string()));
                }
                info!(issuer = %metadata.issuer, jwks_uri = %metadata.jwks_uri, "Discovered OIDC provider");

                let keys = Arc::new(KeySetCache::new(
                    metadata.jwks_uri.clone(),
                    self.http.clone(),
                    self.jwks_options.clone(),
                ));
                keys.spawn_refresher(self.shutdown.clone());
                Ok(Provider { metadata, keys })
            })
            .await
    }

    /// Raw discovery document, for the well-known rewrite.
    pub async fn discovery_document(&self) -> Result<Value, OidcError> {
        Ok(self
            .http
            .get(self.discovery_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Verify an access token according to the configured method.
    pub async fn verify_access_token(&self, token: &str) -> Result<VerifiedAccessToken, OidcError> {
        match self.verify_method {
            AccessTokenVerifyMethod::None => {
                debug!("Access token verification disabled");
                Ok(VerifiedAccessToken::default())
            }
            AccessTokenVerifyMethod::Jwt => {
                let provider = self.provider().await?;
                let issuer = provider
                    .metadata
                    .access_token_issuer
                    .as_deref()
                    .filter(|i| !i.is_empty())
                    .unwrap_or(&self.issuer);

                let header = jsonwebtoken::decode_header(token)?;
                let mut validation = build_validation(&header)?;
                validation.set_issuer(&[issuer]);
                validation.validate_aud = false;

                let kid = header.kid.as_deref().ok_or(OidcError::MissingKeyId)?;
                let key = provider.keys.decoding_key(kid).await?;
                let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)?;
                let expires_at = data.claims.expires_at();
                Ok(VerifiedAccessToken {
                    claims: data.claims,
                    expires_at,
                })
            }
        }
    }

    /// Fetch userinfo claims with `token`.
    pub async fn userinfo(&self, token: &str) -> Result<Claims, OidcError> {
        let endpoint = self
            .provider()
            .await?
            .metadata
            .userinfo_endpoint
            .clone()
            .ok_or_else(|| OidcError::UserInfo("provider has no userinfo endpoint".to_string()))?;

        let response = self
            .http
            .get(endpoint)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;

        let is_jwt = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/jwt"));

        if is_jwt {
            let body = response.text().await?;
            decode_unverified(body.trim()).map_err(|e| OidcError::UserInfo(e.to_string()))
        } else {
            response
                .json::<Claims>()
                .await
                .map_err(|e| OidcError::UserInfo(e.to_string()))
        }
    }

    /// Verify a back-channel logout token.
    pub async fn verify_logout_token(&self, raw: &str) -> Result<LogoutToken, OidcError> {
        let provider = self.provider().await?;

        // Cheap structural checks before touching keys
        let claims = decode_unverified(raw)?;
        let subject = claims.get_str("sub").filter(|s| !s.is_empty()).map(str::to_string);
        let session_id = claims.session_id().map(str::to_string);
        if subject.is_none() && session_id.is_none() {
            return Err(OidcError::LogoutToken(
                "must contain either sub or sid".to_string(),
            ));
        }
        let has_event = claims
            .get("events")
            .and_then(Value::as_object)
            .is_some_and(|events| events.contains_key(BACKCHANNEL_LOGOUT_EVENT));
        if !has_event {
            return Err(OidcError::LogoutToken(
                "must contain the back-channel logout event".to_string(),
            ));
        }
        if claims.get("nonce").is_some() {
            return Err(OidcError::LogoutToken("must not contain a nonce".to_string()));
        }
        let issuer = claims.get_str("iss").unwrap_or_default();
        if issuer != self.issuer {
            return Err(OidcError::LogoutToken(format!(
                "issued by a different provider: expected {}, got {issuer}",
                self.issuer
            )));
        }

        let header = jsonwebtoken::decode_header(raw)?;
        let mut validation = build_validation(&header)?;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        let kid = header.kid.as_deref().ok_or(OidcError::MissingKeyId)?;
        let key = provider.keys.decoding_key(kid).await?;
        jsonwebtoken::decode::<Claims>(raw, &key, &validation)?;

        Ok(LogoutToken {
            issuer: issuer.to_string(),
            subject,
            session_id,
        })
    }
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Result<Validation, OidcError> {
    match header.alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => {
            let mut v = Validation::new(header.alg);
            v.leeway = 60; // 60-second clock skew tolerance
            Ok(v)
        }
        other => Err(OidcError::UnsupportedAlgorithm(other)),
    }
}

/// Decode a JWT payload without verifying it.
fn decode_unverified(token: &str) -> Result<Claims, OidcError> {
    let invalid = || {
        OidcError::Jwt(jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::InvalidToken,
        ))
    };

    let payload = token.split('.').nth(1).ok_or_else(invalid)?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload)
        .map_err(|_| invalid())?;
    serde_json::from_slice::<Claims>(&bytes).map_err(|_| invalid())
}
