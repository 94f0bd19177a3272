//! In-memory collaborators seeded from the `directory` config section.
//!
//! Production deployments put a real directory behind [`UserBackend`]; these
//! implementations make the gateway runnable on its own and back the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, KeyInit, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use super::{
    BackendSession, CredentialKind, IdentityError, KeyStoreError, RoleService, SigningKeyStore,
    User, UserBackend,
};
use crate::claims::Claims;
use crate::config::{AutoProvisionClaims, DirectoryConfig, PublicShareConfig};

struct StoredUser {
    user: User,
    password: Option<String>,
    app_passwords: Vec<String>,
}

/// User backend over a fixed set of users and public shares.
pub struct InMemoryUserBackend {
    users: RwLock<HashMap<String, StoredUser>>,
    shares: HashMap<String, PublicShareConfig>,
    claims: AutoProvisionClaims,
    issuer: String,
}

impl InMemoryUserBackend {
    /// Seed from config. `issuer` is recorded as the idp of provisioned users.
    pub fn from_config(
        directory: &DirectoryConfig,
        claims: AutoProvisionClaims,
        issuer: impl Into<String>,
    ) -> Self {
        let users = directory
            .users
            .iter()
            .map(|u| {
                let user = User {
                    id: u.id.clone(),
                    idp: u.idp.clone(),
                    username: u.username.clone(),
                    display_name: u.display_name.clone(),
                    mail: u.mail.clone(),
                    groups: u.groups.clone(),
                    enabled: u.enabled,
                    roles: Vec::new(),
                };
                (
                    u.id.clone(),
                    StoredUser {
                        user,
                        password: u.password.clone(),
                        app_passwords: u.app_passwords.clone(),
                    },
                )
            })
            .collect();
        let shares = directory
            .public_shares
            .iter()
            .map(|s| (s.token.clone(), s.clone()))
            .collect();

        Self {
            users: RwLock::new(users),
            shares,
            claims,
            issuer: issuer.into(),
        }
    }

    /// Snapshot of a user by id.
    pub fn user(&self, id: &str) -> Option<User> {
        self.users.read().get(id).map(|s| s.user.clone())
    }

    /// Number of known users.
    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    fn find<F>(&self, predicate: F) -> Option<User>
    where
        F: Fn(&User) -> bool,
    {
        self.users
            .read()
            .values()
            .find(|s| predicate(&s.user))
            .map(|s| s.user.clone())
    }

    fn mint_token(subject: &str) -> String {
        format!("{subject}.{}", Uuid::new_v4().simple())
    }

    fn check_secret(expected: &str, provided: &str) -> bool {
        expected.len() == provided.len() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
    }

    fn authenticate_user(
        &self,
        login: &str,
        secret: &str,
        app_password: bool,
    ) -> Result<BackendSession, IdentityError> {
        let users = self.users.read();
        let stored = users
            .values()
            .find(|s| s.user.username == login || (!s.user.mail.is_empty() && s.user.mail == login))
            .ok_or(IdentityError::InvalidCredentials)?;

        let matches = if app_password {
            stored
                .app_passwords
                .iter()
                .any(|p| Self::check_secret(p, secret))
        } else {
            stored
                .password
                .as_deref()
                .is_some_and(|p| Self::check_secret(p, secret))
        };
        if !matches {
            return Err(IdentityError::InvalidCredentials);
        }
        if !stored.user.enabled {
            return Err(IdentityError::Disabled);
        }

        Ok(BackendSession {
            user: Some(stored.user.clone()),
            token: Self::mint_token(&stored.user.id),
        })
    }

    fn authenticate_share(&self, token: &str, secret: &str) -> Result<BackendSession, IdentityError> {
        let share = self
            .shares
            .get(token)
            .ok_or(IdentityError::InvalidCredentials)?;

        let valid = if let Some(password) = secret.strip_prefix("password|") {
            share
                .password
                .as_deref()
                .is_none_or(|expected| Self::check_secret(expected, password))
        } else if let Some(rest) = secret.strip_prefix("signature|") {
            let (signature, expiration) = rest
                .split_once('|')
                .ok_or(IdentityError::InvalidCredentials)?;
            share
                .signing_secret
                .as_deref()
                .is_some_and(|key| verify_share_signature(key, token, signature, expiration))
        } else {
            false
        };

        if valid {
            Ok(BackendSession {
                user: None,
                token: Self::mint_token(&format!("share-{token}")),
            })
        } else {
            Err(IdentityError::InvalidCredentials)
        }
    }
}

/// Sign a public link: `hex(HMAC-SHA256(secret, "<token>|<expiration>"))`.
pub fn sign_share_link(secret: &str, token: &str, expiration: &str) -> String {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(format!("{token}|{expiration}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_share_signature(secret: &str, token: &str, signature: &str, expiration: &str) -> bool {
    let Ok(expires) = DateTime::parse_from_rfc3339(expiration) else {
        return false;
    };
    if expires.with_timezone(&Utc) <= Utc::now() {
        debug!(token = %token, "Public link signature expired");
        return false;
    }
    let expected = sign_share_link(secret, token, expiration);
    !expected.is_empty()
        && expected.len() == signature.len()
        && bool::from(expected.as_bytes().ct_eq(signature.as_bytes()))
}

#[async_trait]
impl UserBackend for InMemoryUserBackend {
    async fn get_user_by_claims(
        &self,
        claim: &str,
        value: &str,
    ) -> Result<(User, String), IdentityError> {
        let user = match claim {
            "username" => self.find(|u| u.username == value),
            "mail" => self.find(|u| u.mail == value),
            "userid" => self.user(value),
            other => {
                return Err(IdentityError::Unavailable(format!(
                    "unsupported lookup claim '{other}'"
                )));
            }
        }
        .ok_or(IdentityError::NotFound)?;

        if !user.enabled {
            return Err(IdentityError::Disabled);
        }
        let token = Self::mint_token(&user.id);
        Ok((user, token))
    }

    async fn authenticate(
        &self,
        kind: CredentialKind,
        login: &str,
        secret: &str,
    ) -> Result<BackendSession, IdentityError> {
        match kind {
            CredentialKind::Password => self.authenticate_user(login, secret, false),
            CredentialKind::AppPassword => self.authenticate_user(login, secret, true),
            CredentialKind::PublicShare => self.authenticate_share(login, secret),
        }
    }

    async fn create_user_from_claims(&self, claims: &Claims) -> Result<User, IdentityError> {
        let required = |name: &str| {
            claims
                .lookup_path(name)
                .map(str::to_string)
                .ok_or_else(|| IdentityError::MissingClaim(name.to_string()))
        };
        let username = required(&self.claims.username)?;
        let display_name = required(&self.claims.display_name)?;
        let mail = claims
            .lookup_path(&self.claims.email)
            .unwrap_or_default()
            .to_string();

        let mut users = self.users.write();
        if users.values().any(|s| s.user.username == username) {
            return Err(IdentityError::AlreadyExists(username));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            idp: claims
                .get_str("iss")
                .map_or_else(|| self.issuer.clone(), str::to_string),
            username,
            display_name,
            mail,
            groups: Vec::new(),
            enabled: true,
            roles: Vec::new(),
        };
        users.insert(
            user.id.clone(),
            StoredUser {
                user: user.clone(),
                password: None,
                app_passwords: Vec::new(),
            },
        );
        Ok(user)
    }

    async fn update_user_if_needed(
        &self,
        user: &User,
        claims: &Claims,
    ) -> Result<(), IdentityError> {
        let display_name = claims.lookup_path(&self.claims.display_name);
        let mail = claims.lookup_path(&self.claims.email);

        let mut users = self.users.write();
        let stored = users.get_mut(&user.id).ok_or(IdentityError::NotFound)?;
        if let Some(name) = display_name.filter(|n| *n != stored.user.display_name) {
            debug!(user_id = %user.id, "Updating display name from claims");
            stored.user.display_name = name.to_string();
        }
        if let Some(mail) = mail.filter(|m| *m != stored.user.mail) {
            debug!(user_id = %user.id, "Updating mail from claims");
            stored.user.mail = mail.to_string();
        }
        Ok(())
    }

    async fn sync_group_memberships(
        &self,
        user: &User,
        claims: &Claims,
    ) -> Result<(), IdentityError> {
        let mut groups = claims.get_strings(&self.claims.groups);
        groups.sort();
        groups.dedup();

        let mut users = self.users.write();
        let stored = users.get_mut(&user.id).ok_or(IdentityError::NotFound)?;
        if stored.user.groups != groups {
            debug!(user_id = %user.id, groups = groups.len(), "Synchronizing group memberships");
            stored.user.groups = groups;
        }
        Ok(())
    }
}

/// Role assignments kept in a concurrent map.
#[derive(Default)]
pub struct InMemoryRoleService {
    assignments: DashMap<String, Vec<String>>,
}

impl InMemoryRoleService {
    /// Seed from config.
    pub fn from_config(directory: &DirectoryConfig) -> Self {
        let assignments = directory
            .role_assignments
            .iter()
            .map(|(user, roles)| (user.clone(), roles.clone()))
            .collect();
        Self { assignments }
    }
}

#[async_trait]
impl RoleService for InMemoryRoleService {
    async fn list_role_assignments(&self, user_id: &str) -> Result<Vec<String>, IdentityError> {
        Ok(self
            .assignments
            .get(user_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn assign_role_to_user(&self, user_id: &str, role_id: &str) -> Result<(), IdentityError> {
        self.assignments
            .insert(user_id.to_string(), vec![role_id.to_string()]);
        Ok(())
    }
}

/// Signing keys from config.
#[derive(Default)]
pub struct InMemorySigningKeyStore {
    keys: HashMap<String, Vec<u8>>,
}

impl InMemorySigningKeyStore {
    /// Seed from config.
    pub fn from_config(directory: &DirectoryConfig) -> Self {
        Self {
            keys: directory
                .signing_keys
                .iter()
                .map(|(user, key)| (user.clone(), key.as_bytes().to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl SigningKeyStore for InMemorySigningKeyStore {
    async fn read(&self, user_id: &str) -> Result<Vec<u8>, KeyStoreError> {
        self.keys.get(user_id).cloned().ok_or(KeyStoreError::NotFound)
    }
}
