//! Turns an authenticated request into a canonical user with roles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, error, info, warn};

use super::roles::RoleAssigner;
use super::{Identity, IdentityError, User, UserBackend};
use crate::auth::Authenticated;
use crate::claims::Claims;
use crate::config::IdentityConfig;

/// Why identity resolution failed.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The caller is not allowed in (401).
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Something on our side broke (500).
    #[error("identity resolution failed: {0}")]
    Internal(String),
}

/// Resolves users from claims, provisioning and syncing them when configured.
pub struct AccountResolver {
    backend: Arc<dyn UserBackend>,
    roles: Arc<dyn RoleAssigner>,
    user_oidc_claim: String,
    user_cs3_claim: String,
    auto_provision: bool,
    group_sync_ttl: Duration,
    last_group_sync: DashMap<String, Instant>,
}

impl AccountResolver {
    /// Create a resolver.
    pub fn new(
        config: &IdentityConfig,
        backend: Arc<dyn UserBackend>,
        roles: Arc<dyn RoleAssigner>,
    ) -> Self {
        Self {
            backend,
            roles,
            user_oidc_claim: config.user_oidc_claim.clone(),
            user_cs3_claim: config.user_cs3_claim.clone(),
            auto_provision: config.auto_provision_accounts,
            group_sync_ttl: config.group_sync_ttl,
            last_group_sync: DashMap::new(),
        }
    }

    /// Resolve the identity behind an authenticated request.
    pub async fn resolve(&self, auth: Authenticated) -> Result<Identity, ResolveError> {
        let Authenticated {
            authenticator,
            claims,
            user,
            access_token,
        } = auth;

        if let Some(user) = user {
            let user = self.roles.apply_user_role(user).await.map_err(|e| {
                error!(authenticator, error = %e, "Could not load role assignment");
                ResolveError::Internal("could not load role assignment".to_string())
            })?;
            return Ok(Identity {
                claims,
                user: Some(user),
                access_token,
            });
        }

        let Some(claims) = claims else {
            // Public share: the share token is all the backend needs
            return Ok(Identity {
                claims: None,
                user: None,
                access_token,
            });
        };

        let (user, token) = self.resolve_claims(authenticator, &claims).await?;
        Ok(Identity {
            claims: Some(claims),
            user: Some(user),
            access_token: Some(token).filter(|t| !t.is_empty()).or(access_token),
        })
    }

    async fn resolve_claims(
        &self,
        authenticator: &str,
        claims: &Claims,
    ) -> Result<(User, String), ResolveError> {
        let Some(value) = claims.lookup_path(&self.user_oidc_claim).map(str::to_string) else {
            error!(
                authenticator,
                claim = %self.user_oidc_claim,
                "Claim not present or not a string"
            );
            return Err(ResolveError::Internal(format!(
                "claim '{}' not found",
                self.user_oidc_claim
            )));
        };

        let (user, token) = match self
            .backend
            .get_user_by_claims(&self.user_cs3_claim, &value)
            .await
        {
            Ok(found) => found,
            Err(IdentityError::NotFound) if self.auto_provision => {
                self.provision(claims, &value).await?
            }
            Err(IdentityError::NotFound) => {
                debug!(authenticator, claim = %self.user_cs3_claim, "User not found and auto-provisioning is off");
                return Err(ResolveError::Unauthenticated("unknown user".to_string()));
            }
            Err(IdentityError::Disabled) => {
                info!(authenticator, "Rejecting disabled user");
                return Err(ResolveError::Unauthenticated("user disabled".to_string()));
            }
            Err(e) => {
                error!(authenticator, error = %e, "User lookup failed");
                return Err(ResolveError::Internal("user lookup failed".to_string()));
            }
        };

        if self.auto_provision {
            if let Err(e) = self.backend.update_user_if_needed(&user, claims).await {
                error!(user_id = %user.id, error = %e, "Failed to update user from claims");
            }
            self.sync_groups(&user, claims).await;
        }

        let user = self
            .roles
            .update_user_role_assignment(user, claims)
            .await
            .map_err(|e| {
                error!(authenticator, error = %e, "Role assignment failed");
                ResolveError::Internal("role assignment failed".to_string())
            })?;

        Ok((user, token))
    }

    async fn provision(&self, claims: &Claims, value: &str) -> Result<(User, String), ResolveError> {
        debug!(claim = %self.user_cs3_claim, value = %value, "Auto-provisioning user");
        let created = self.backend.create_user_from_claims(claims).await.map_err(|e| {
            error!(error = %e, "Failed to provision user");
            ResolveError::Internal("user provisioning failed".to_string())
        })?;
        info!(user_id = %created.id, username = %created.username, "Provisioned user");

        self.backend
            .get_user_by_claims("userid", &created.id)
            .await
            .map_err(|e| {
                error!(user_id = %created.id, error = %e, "Provisioned user not readable");
                ResolveError::Internal("user provisioning failed".to_string())
            })
    }

    async fn sync_groups(&self, user: &User, claims: &Claims) {
        let now = Instant::now();
        let due = match self.last_group_sync.entry(user.id.clone()) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) >= self.group_sync_ttl {
                    e.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        };
        if !due {
            return;
        }
        if let Err(e) = self.backend.sync_group_memberships(user, claims).await {
            warn!(user_id = %user.id, error = %e, "Failed to sync group memberships");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::identity::roles::{DefaultRoleAssigner, ROLE_USER};
    use crate::identity::{BackendSession, CredentialKind, InMemoryRoleService};

    #[derive(Default)]
    struct FakeBackend {
        users: parking_lot::Mutex<Vec<User>>,
        syncs: AtomicUsize,
    }

    #[async_trait]
    impl UserBackend for FakeBackend {
        async fn get_user_by_claims(
            &self,
            claim: &str,
            value: &str,
        ) -> Result<(User, String), IdentityError> {
            let users = self.users.lock();
            let user = users
                .iter()
                .find(|u| match claim {
                    "userid" => u.id == value,
                    _ => u.username == value,
                })
                .cloned()
                .ok_or(IdentityError::NotFound)?;
            if !user.enabled {
                return Err(IdentityError::Disabled);
            }
            Ok((user, "backend-token".to_string()))
        }

        async fn authenticate(
            &self,
            _kind: CredentialKind,
            _login: &str,
            _secret: &str,
        ) -> Result<BackendSession, IdentityError> {
            Err(IdentityError::InvalidCredentials)
        }

        async fn create_user_from_claims(&self, claims: &Claims) -> Result<User, IdentityError> {
            let user = User {
                id: "new-id".to_string(),
                username: claims
                    .get_str("preferred_username")
                    .unwrap_or_default()
                    .to_string(),
                enabled: true,
                ..Default::default()
            };
            self.users.lock().push(user.clone());
            Ok(user)
        }

        async fn update_user_if_needed(&self, _: &User, _: &Claims) -> Result<(), IdentityError> {
            Ok(())
        }

        async fn sync_group_memberships(&self, _: &User, _: &Claims) -> Result<(), IdentityError> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn resolver(backend: Arc<FakeBackend>, auto_provision: bool) -> AccountResolver {
        let config = IdentityConfig {
            auto_provision_accounts: auto_provision,
            ..Default::default()
        };
        let roles = Arc::new(DefaultRoleAssigner::new(Arc::new(InMemoryRoleService::default())));
        AccountResolver::new(&config, backend, roles)
    }

    fn oidc(value: serde_json::Value) -> Authenticated {
        Authenticated {
            authenticator: "oidc",
            claims: Some(serde_json::from_value(value).unwrap()),
            user: None,
            access_token: None,
        }
    }

    fn backend_with(username: &str, enabled: bool) -> Arc<FakeBackend> {
        let backend = FakeBackend::default();
        backend.users.lock().push(User {
            id: format!("id-{username}"),
            username: username.to_string(),
            enabled,
            ..Default::default()
        });
        Arc::new(backend)
    }

    #[tokio::test]
    async fn test_known_user_gets_default_role_and_token() {
        let r = resolver(backend_with("alice", true), false);
        let identity = r.resolve(oidc(json!({"preferred_username": "alice"}))).await.unwrap();
        let user = identity.user.unwrap();
        assert_eq!(user.id, "id-alice");
        assert_eq!(user.roles, vec![ROLE_USER]);
        assert_eq!(identity.access_token.as_deref(), Some("backend-token"));
    }

    #[tokio::test]
    async fn test_missing_claim_is_internal() {
        let r = resolver(backend_with("alice", true), false);
        assert!(matches!(
            r.resolve(oidc(json!({"sub": "x"}))).await,
            Err(ResolveError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_without_provisioning_is_unauthenticated() {
        let r = resolver(backend_with("alice", true), false);
        assert!(matches!(
            r.resolve(oidc(json!({"preferred_username": "bob"}))).await,
            Err(ResolveError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_user_is_unauthenticated() {
        let r = resolver(backend_with("alice", false), true);
        assert!(matches!(
            r.resolve(oidc(json!({"preferred_username": "alice"}))).await,
            Err(ResolveError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_provision_creates_and_rereads() {
        let backend = backend_with("alice", true);
        let r = resolver(Arc::clone(&backend), true);
        let identity = r.resolve(oidc(json!({"preferred_username": "bob"}))).await.unwrap();
        assert_eq!(identity.user.unwrap().id, "new-id");
        assert_eq!(backend.users.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_group_sync_respects_ttl() {
        let backend = backend_with("alice", true);
        let r = resolver(Arc::clone(&backend), true);
        for _ in 0..3 {
            r.resolve(oidc(json!({"preferred_username": "alice"}))).await.unwrap();
        }
        assert_eq!(backend.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_resolved_user_keeps_token() {
        let r = resolver(backend_with("alice", true), false);
        let identity = r
            .resolve(Authenticated {
                authenticator: "signed_url",
                claims: None,
                user: Some(User {
                    id: "id-alice".to_string(),
                    ..Default::default()
                }),
                access_token: Some("signed-token".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(identity.access_token.as_deref(), Some("signed-token"));
        assert!(identity.user.unwrap().roles.is_empty());
    }

    #[tokio::test]
    async fn test_public_share_passes_through() {
        let r = resolver(backend_with("alice", true), false);
        let identity = r
            .resolve(Authenticated {
                authenticator: "public_share",
                claims: None,
                user: None,
                access_token: Some("share-token".to_string()),
            })
            .await
            .unwrap();
        assert!(identity.user.is_none());
        assert_eq!(identity.access_token.as_deref(), Some("share-token"));
    }
}
