//! Pre-signed URL authentication
//!
//! A signed URL carries `OC-Credential`, `OC-Date`, `OC-Expires`, `OC-Verb`
//! and `OC-Signature` query parameters. The signature is checked against the
//! owner's signing key over the canonical form of the URL (see
//! [`crate::signing`]).

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, request::Parts};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::{Authenticated, Authenticator, client_addr};
use crate::config::PreSignedUrlConfig;
use crate::identity::{SigningKeyStore, UserBackend};
use crate::signing::{self, MAX_EXPIRES_SECS};

const SIGNATURE_PARAM: &str = "OC-Signature";

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Why a signed URL was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignedUrlError {
    /// A required query parameter is missing.
    #[error("required {0} parameter not found")]
    MissingParam(&'static str),

    /// `OC-Verb` does not match the request method.
    #[error("required {verb} does not match the request method {method}")]
    VerbMismatch {
        /// Signed verb
        verb: String,
        /// Actual method
        method: String,
    },

    /// Method not allowed for signed URLs.
    #[error("request method {0} is not allowed")]
    MethodNotAllowed(String),

    /// `OC-Expires` is not in `1..=604800`.
    #[error("invalid OC-Expires: {0}")]
    InvalidExpires(String),

    /// `OC-Date` is not RFC 3339.
    #[error("invalid OC-Date: {0}")]
    InvalidDate(String),

    /// Current time is outside the signed window.
    #[error("url is expired or not yet valid")]
    Expired,

    /// Credential owner or key unknown.
    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),

    /// Signature mismatch
    #[error("signature mismatch")]
    InvalidSignature,
}

/// Authenticates requests by URL signature.
pub struct SignedUrlAuthenticator {
    users: Arc<dyn UserBackend>,
    keys: Arc<dyn SigningKeyStore>,
    enabled: bool,
    allowed_methods: Vec<String>,
    public_scheme: String,
    clock: Clock,
}

impl SignedUrlAuthenticator {
    /// Create the authenticator.
    pub fn new(
        users: Arc<dyn UserBackend>,
        keys: Arc<dyn SigningKeyStore>,
        config: &PreSignedUrlConfig,
        public_scheme: &str,
    ) -> Self {
        Self {
            users,
            keys,
            enabled: config.enabled,
            allowed_methods: config
                .allowed_http_methods
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            public_scheme: public_scheme.to_string(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock used for the validity window.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn validate_params(
        &self,
        request: &Parts,
        params: &[(String, String)],
    ) -> Result<(), SignedUrlError> {
        let get = |name: &'static str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .filter(|v| !v.is_empty())
                .ok_or(SignedUrlError::MissingParam(name))
        };
        for name in signing::SIGNED_PARAMS {
            get(name)?;
        }
        get(SIGNATURE_PARAM)?;

        let verb = get("OC-Verb")?;
        let method = request.method.as_str();
        if !verb.eq_ignore_ascii_case(method) {
            return Err(SignedUrlError::VerbMismatch {
                verb: verb.to_string(),
                method: method.to_string(),
            });
        }
        if !self.allowed_methods.iter().any(|m| m == method) {
            return Err(SignedUrlError::MethodNotAllowed(method.to_string()));
        }

        let raw_expires = get("OC-Expires")?;
        let expires: i64 = raw_expires
            .parse()
            .ok()
            .filter(|e| (1..=MAX_EXPIRES_SECS).contains(e))
            .ok_or_else(|| SignedUrlError::InvalidExpires(raw_expires.to_string()))?;

        let raw_date = get("OC-Date")?;
        let date = DateTime::parse_from_rfc3339(raw_date)
            .map_err(|_| SignedUrlError::InvalidDate(raw_date.to_string()))?
            .with_timezone(&Utc);

        let now = (self.clock)();
        if now < date || now >= date + Duration::seconds(expires) {
            return Err(SignedUrlError::Expired);
        }
        Ok(())
    }

    fn scheme_and_host(&self, request: &Parts) -> (String, String) {
        let header_value = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let scheme = header_value("x-forwarded-proto").unwrap_or_else(|| self.public_scheme.clone());
        let host = header_value("x-forwarded-host")
            .or_else(|| header_value(header::HOST.as_str()))
            .or_else(|| request.uri.authority().map(ToString::to_string))
            .unwrap_or_default();
        (scheme, host)
    }

    async fn verify(&self, request: &Parts) -> Result<Authenticated, SignedUrlError> {
        let params: Vec<(String, String)> = request
            .uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        self.validate_params(request, &params)?;

        let value = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };

        let (user, token) = self
            .users
            .get_user_by_claims("username", value("OC-Credential"))
            .await
            .map_err(|e| SignedUrlError::KeyUnavailable(e.to_string()))?;
        let key = self
            .keys
            .read(&user.id)
            .await
            .map_err(|e| SignedUrlError::KeyUnavailable(e.to_string()))?;
        if key.is_empty() {
            return Err(SignedUrlError::KeyUnavailable("empty key".to_string()));
        }

        let (scheme, host) = self.scheme_and_host(request);
        let canonical = signing::canonical_url(
            &scheme,
            &host,
            request.uri.path(),
            params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        if !signing::verify_signature(&canonical, &key, value(SIGNATURE_PARAM)) {
            return Err(SignedUrlError::InvalidSignature);
        }

        Ok(Authenticated {
            authenticator: "signed_url",
            claims: None,
            user: Some(user),
            access_token: Some(token),
        })
    }
}

#[async_trait]
impl Authenticator for SignedUrlAuthenticator {
    fn name(&self) -> &'static str {
        "signed_url"
    }

    async fn authenticate(&self, request: &Parts) -> Option<Authenticated> {
        if !self.enabled {
            return None;
        }
        let has_signature = request.uri.query().is_some_and(|q| {
            url::form_urlencoded::parse(q.as_bytes()).any(|(k, _)| k == SIGNATURE_PARAM)
        });
        if !has_signature {
            return None;
        }

        match self.verify(request).await {
            Ok(authenticated) => {
                debug!(path = %request.uri.path(), authenticator = "signed_url", "Signed URL accepted");
                Some(authenticated)
            }
            Err(e) => {
                info!(
                    authenticator = "signed_url",
                    path = %request.uri.path(),
                    client = %client_addr(request),
                    error = %e,
                    "Could not verify signed URL"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoProvisionClaims, DirectoryConfig, DirectoryUser};
    use crate::identity::{InMemorySigningKeyStore, InMemoryUserBackend};
    use axum::http::{Method, Request};
    use pretty_assertions::assert_eq;

    const DATE: &str = "2024-05-01T10:00:00Z";
    const KEY: &str = "einstein-signing-key";

    fn user(id: &str, username: &str) -> DirectoryUser {
        DirectoryUser {
            id: id.to_string(),
            username: username.to_string(),
            display_name: username.to_string(),
            mail: String::new(),
            idp: String::new(),
            password: None,
            app_passwords: vec![],
            groups: vec![],
            enabled: true,
        }
    }

    fn directory() -> DirectoryConfig {
        DirectoryConfig {
            users: vec![user("u-einstein", "einstein"), user("u-newton", "newton")],
            signing_keys: [
                ("u-einstein".to_string(), KEY.to_string()),
                ("u-newton".to_string(), "newton-signing-key".to_string()),
            ]
            .into(),
            ..Default::default()
        }
    }

    fn authenticator(now: &str) -> SignedUrlAuthenticator {
        let directory = directory();
        let now = DateTime::parse_from_rfc3339(now).unwrap().with_timezone(&Utc);
        SignedUrlAuthenticator::new(
            Arc::new(InMemoryUserBackend::from_config(
                &directory,
                AutoProvisionClaims::default(),
                "",
            )),
            Arc::new(InMemorySigningKeyStore::from_config(&directory)),
            &PreSignedUrlConfig::default(),
            "https",
        )
        .with_clock(move || now)
    }

    fn signed(method: &str, verb: &str, expires: u32) -> Parts {
        let url = signing::sign_url(
            "https",
            "cloud.example.com",
            "/remote.php/dav/files/einstein/report.pdf",
            "einstein",
            DATE,
            expires,
            verb,
            KEY.as_bytes(),
        );
        let uri = url.trim_start_matches("https://cloud.example.com");
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "cloud.example.com")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn test_valid_signature_authenticates_owner() {
        let auth = authenticator("2024-05-01T10:05:00Z");
        let out = auth.authenticate(&signed("GET", "GET", 1200)).await.unwrap();
        assert_eq!(out.user.unwrap().id, "u-einstein");
        assert!(out.access_token.is_some());
    }

    #[tokio::test]
    async fn test_window_boundaries() {
        let request = signed("GET", "GET", 600);

        // Date + Expires - 1
        let auth = authenticator("2024-05-01T10:09:59Z");
        assert!(auth.verify(&request).await.is_ok());

        // Date + Expires
        let auth = authenticator("2024-05-01T10:10:00Z");
        assert_eq!(auth.verify(&request).await.unwrap_err(), SignedUrlError::Expired);

        // Before Date
        let auth = authenticator("2024-05-01T09:59:59Z");
        assert_eq!(auth.verify(&request).await.unwrap_err(), SignedUrlError::Expired);
    }

    #[tokio::test]
    async fn test_verb_and_method_checks() {
        let auth = authenticator("2024-05-01T10:00:30Z");
        // Verb comparison ignores case
        assert!(auth.verify(&signed("GET", "get", 60)).await.is_ok());

        let err = auth.verify(&signed("PUT", "GET", 60)).await.unwrap_err();
        assert!(matches!(err, SignedUrlError::VerbMismatch { .. }));

        let err = auth.verify(&signed("PUT", "PUT", 60)).await.unwrap_err();
        assert_eq!(err, SignedUrlError::MethodNotAllowed("PUT".to_string()));
    }

    #[tokio::test]
    async fn test_expires_bounds() {
        let auth = authenticator("2024-05-01T10:00:00Z");
        let err = auth.verify(&signed("GET", "GET", 0)).await.unwrap_err();
        assert_eq!(err, SignedUrlError::InvalidExpires("0".to_string()));
        let err = auth.verify(&signed("GET", "GET", 604_801)).await.unwrap_err();
        assert_eq!(err, SignedUrlError::InvalidExpires("604801".to_string()));
        assert!(auth.verify(&signed("GET", "GET", 604_800)).await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_path_fails() {
        let auth = authenticator("2024-05-01T10:00:30Z");
        let mut request = signed("GET", "GET", 60);
        let query = request.uri.query().unwrap().to_string();
        request.uri = format!("/remote.php/dav/files/einstein/other.pdf?{query}")
            .parse()
            .unwrap();
        assert_eq!(
            auth.verify(&request).await.unwrap_err(),
            SignedUrlError::InvalidSignature
        );
    }

    /// Replace one query parameter, keeping the others as they are.
    fn with_param(mut request: Parts, name: &str, value: &str) -> Parts {
        let query = request.uri.query().unwrap_or_default().to_string();
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            serializer.append_pair(&k, if k == name { value } else { v.as_ref() });
        }
        request.uri = format!("{}?{}", request.uri.path(), serializer.finish())
            .parse()
            .unwrap();
        request
    }

    #[tokio::test]
    async fn test_tampered_signed_params_fail() {
        let auth = authenticator("2024-05-01T10:00:30Z");
        assert!(auth.verify(&signed("GET", "GET", 60)).await.is_ok());

        // Every case stays inside the window with an allowed method
        for (name, value) in [
            ("OC-Credential", "newton"),
            ("OC-Date", "2024-05-01T10:00:10Z"),
            ("OC-Expires", "120"),
        ] {
            let request = with_param(signed("GET", "GET", 60), name, value);
            assert_eq!(
                auth.verify(&request).await.unwrap_err(),
                SignedUrlError::InvalidSignature,
                "{name}"
            );
        }

        // Signed for `get`, served as `GET`
        let request = with_param(signed("GET", "get", 60), "OC-Verb", "GET");
        assert_eq!(
            auth.verify(&request).await.unwrap_err(),
            SignedUrlError::InvalidSignature
        );
    }

    #[tokio::test]
    async fn test_unrelated_params_are_not_signed() {
        let auth = authenticator("2024-05-01T10:00:30Z");
        let mut request = signed("GET", "GET", 60);
        let path_and_query = request.uri.path_and_query().unwrap().as_str().to_string();
        request.uri = format!("{path_and_query}&x-client=web&download=1")
            .parse()
            .unwrap();
        let out = auth.verify(&request).await.unwrap();
        assert_eq!(out.user.unwrap().id, "u-einstein");
    }

    #[tokio::test]
    async fn test_forwarded_host_is_used() {
        let auth = authenticator("2024-05-01T10:00:30Z");
        let mut request = signed("GET", "GET", 60);
        request
            .headers
            .insert(header::HOST, "10.0.0.5:9200".parse().unwrap());
        assert_eq!(
            auth.verify(&request).await.unwrap_err(),
            SignedUrlError::InvalidSignature
        );
        request
            .headers
            .insert("x-forwarded-host", "cloud.example.com".parse().unwrap());
        assert!(auth.verify(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_param_and_unknown_credential() {
        let auth = authenticator("2024-05-01T10:00:30Z");
        let request = Request::builder()
            .method(Method::GET)
            .uri("/x?OC-Signature=abc&OC-Credential=einstein")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert_eq!(
            auth.verify(&request).await.unwrap_err(),
            SignedUrlError::MissingParam("OC-Date")
        );

        let request = Request::builder()
            .uri(format!(
                "/x?OC-Credential=nobody&OC-Date={DATE}&OC-Expires=60&OC-Verb=GET&OC-Signature=abc"
            ))
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert!(matches!(
            auth.verify(&request).await.unwrap_err(),
            SignedUrlError::KeyUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_disabled_or_unsigned_declines() {
        let auth = authenticator("2024-05-01T10:00:30Z");
        let plain = Request::builder().uri("/x").body(()).unwrap().into_parts().0;
        assert!(auth.authenticate(&plain).await.is_none());

        let mut disabled = authenticator("2024-05-01T10:00:30Z");
        disabled.enabled = false;
        assert!(disabled.authenticate(&signed("GET", "GET", 60)).await.is_none());
    }
}
