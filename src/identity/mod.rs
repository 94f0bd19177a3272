//! Identity: users, the collaborator contracts the gateway consumes, and the
//! per-request resolved identity.

pub mod memory;
pub mod resolver;
pub mod roles;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::claims::Claims;

pub use memory::{InMemoryRoleService, InMemorySigningKeyStore, InMemoryUserBackend};
pub use resolver::{AccountResolver, ResolveError};
pub use roles::{DefaultRoleAssigner, OidcRoleAssigner, RoleAssigner};

/// A canonical user record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Opaque id
    pub id: String,
    /// Identity provider that owns the account.
    pub idp: String,
    /// Login name
    pub username: String,
    /// Display name
    pub display_name: String,
    /// Mail address
    pub mail: String,
    /// Group names
    pub groups: Vec<String>,
    /// Disabled users cannot sign in.
    pub enabled: bool,
    /// Resolved role ids.
    pub roles: Vec<String>,
}

/// Identity backend failures.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No such user.
    #[error("user not found")]
    NotFound,

    /// Account disabled
    #[error("user is disabled")]
    Disabled,

    /// Wrong password, share secret or expired link.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A claim needed to create the user is missing.
    #[error("missing claim: {0}")]
    MissingClaim(String),

    /// Provisioning would duplicate an existing user.
    #[error("user already exists: {0}")]
    AlreadyExists(String),

    /// Role assignment could not be determined.
    #[error("role assignment failed: {0}")]
    RoleAssignment(String),

    /// Backend could not be reached or answered with garbage.
    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Which kind of secret a login carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Account password
    Password,
    /// App-specific password
    AppPassword,
    /// Public share token plus `password|…` or `signature|…|…` secret.
    PublicShare,
}

/// Result of a successful backend authentication.
#[derive(Debug, Clone)]
pub struct BackendSession {
    /// The authenticated user; public shares have none.
    pub user: Option<User>,
    /// Token forwarded to backends.
    pub token: String,
}

/// User directory and authentication backend.
#[async_trait]
pub trait UserBackend: Send + Sync {
    /// Look a user up by `claim` (`username`, `mail` or `userid`) and mint a token.
    async fn get_user_by_claims(&self, claim: &str, value: &str)
    -> Result<(User, String), IdentityError>;

    /// Check a credential.
    async fn authenticate(
        &self,
        kind: CredentialKind,
        login: &str,
        secret: &str,
    ) -> Result<BackendSession, IdentityError>;

    /// Provision a new user from OIDC claims.
    async fn create_user_from_claims(&self, claims: &Claims) -> Result<User, IdentityError>;

    /// Bring display name and mail in line with the claims.
    async fn update_user_if_needed(&self, user: &User, claims: &Claims)
    -> Result<(), IdentityError>;

    /// Bring group memberships in line with the claims.
    async fn sync_group_memberships(&self, user: &User, claims: &Claims)
    -> Result<(), IdentityError>;
}

/// Role assignments store.
#[async_trait]
pub trait RoleService: Send + Sync {
    /// Role ids assigned to a user.
    async fn list_role_assignments(&self, user_id: &str) -> Result<Vec<String>, IdentityError>;

    /// Replace the user's role with `role_id`.
    async fn assign_role_to_user(&self, user_id: &str, role_id: &str) -> Result<(), IdentityError>;
}

/// Signing key store failures.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// No key for this user.
    #[error("signing key not found")]
    NotFound,

    /// Store could not be reached.
    #[error("signing key store unavailable: {0}")]
    Unavailable(String),
}

/// Per-user signing keys for signed URLs.
#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    /// Key bytes for `user_id`.
    async fn read(&self, user_id: &str) -> Result<Vec<u8>, KeyStoreError>;
}

/// Identity resolved for one request.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Claims from the credential, when it carried any.
    pub claims: Option<Claims>,
    /// The canonical user.
    pub user: Option<User>,
    /// Token forwarded to backends in `x-access-token`.
    pub access_token: Option<String>,
}

impl Identity {
    /// No identity at all.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Whether anything vouches for the caller.
    pub fn is_authenticated(&self) -> bool {
        self.claims.is_some() || self.user.is_some() || self.access_token.is_some()
    }
}
