//! Provider key set cache.
//!
//! The key set is fetched on first use and refreshed by a background task
//! every `refresh_interval`. A token with an unknown `kid` may force a
//! refresh, but such refreshes are rate limited to one per `refresh_limit`
//! so a stream of bogus key ids cannot hammer the provider. A failed refresh
//! keeps the previous key set in service.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::OidcError;
use crate::config::JwksConfig;

type RefreshLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A fetched key set.
struct CachedKeySet {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache for one provider.
pub struct KeySetCache {
    jwks_uri: String,
    http: reqwest::Client,
    options: JwksConfig,
    current: RwLock<Option<CachedKeySet>>,
    refresh_lock: tokio::sync::Mutex<()>,
    limiter: RefreshLimiter,
}

impl KeySetCache {
    /// Create an empty cache for `jwks_uri`. Nothing is fetched until first use.
    pub fn new(jwks_uri: impl Into<String>, http: reqwest::Client, options: JwksConfig) -> Self {
        let period = options.refresh_limit.max(std::time::Duration::from_millis(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Self {
            jwks_uri: jwks_uri.into(),
            http,
            options,
            current: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            limiter: RateLimiter::direct(quota),
        }
    }

    /// URI the keys are fetched from.
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Find the decoding key for `kid`, fetching or refreshing as allowed.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, OidcError> {
        if !self.is_loaded() {
            self.refresh().await?;
        }
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }

        if self.options.refresh_unknown_kid && self.limiter.check().is_ok() {
            debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "JWKS refresh for unknown kid failed");
            }
            if let Some(key) = self.lookup(kid) {
                return Ok(key);
            }
        }

        Err(OidcError::UnknownKeyId(kid.to_string()))
    }

    /// Fetch the key set now. On failure the previous set is kept.
    pub async fn refresh(&self) -> Result<(), OidcError> {
        let started = Instant::now();
        let _guard = self.refresh_lock.lock().await;

        // Another task refreshed while we waited
        if self
            .current
            .read()
            .as_ref()
            .is_some_and(|c| c.fetched_at >= started)
        {
            return Ok(());
        }

        match self.fetch().await {
            Ok(keys) => {
                debug!(uri = %self.jwks_uri, keys = keys.keys.len(), "Fetched JWKS");
                *self.current.write() = Some(CachedKeySet {
                    keys,
                    fetched_at: Instant::now(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    uri = %self.jwks_uri,
                    error = %e,
                    stale = self.is_loaded(),
                    "JWKS refresh failed, keeping previous key set"
                );
                Err(e)
            }
        }
    }

    /// Whether a key set has been fetched successfully at least once.
    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    /// Time since the last successful fetch.
    pub fn age(&self) -> Option<std::time::Duration> {
        self.current.read().as_ref().map(|c| c.fetched_at.elapsed())
    }

    /// Refresh on a timer until `shutdown` is cancelled.
    pub fn spawn_refresher(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.options.refresh_interval);
            // First tick fires immediately; the first fetch is lazy
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Failure already logged; previous keys stay in use
                        let _ = cache.refresh().await;
                    }
                    () = shutdown.cancelled() => {
                        info!(uri = %cache.jwks_uri, "JWKS refresher stopped");
                        break;
                    }
                }
            }
        })
    }

    fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        let current = self.current.read();
        current.as_ref().and_then(|c| find_key_in_jwks(&c.keys, kid))
    }

    async fn fetch(&self) -> Result<JwkSet, OidcError> {
        let response = self
            .http
            .get(&self.jwks_uri)
            .timeout(self.options.refresh_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        // Symmetric keys have no place in a public key set
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}
