//! Role assignment drivers

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use super::{IdentityError, RoleService, User};
use crate::claims::Claims;
use crate::config::{OidcRoleMapperConfig, RoleAssignmentConfig, RoleDriver};

/// Role id of `admin`.
pub const ROLE_ADMIN: &str = "71881883-1768-46bd-a24d-a356a2afdf7f";
/// Role id of `spaceadmin`.
pub const ROLE_SPACE_ADMIN: &str = "2aadd357-682c-406b-8874-293091995fdd";
/// Role id of `user`.
pub const ROLE_USER: &str = "d7beeea8-8ff4-406b-8fb6-ab2dd81e6b11";
/// Role id of `user-light`.
pub const ROLE_USER_LIGHT: &str = "38071a68-456a-4553-846a-fa67bf5596cc";

/// Well-known role id for a role name.
pub fn role_id_by_name(name: &str) -> Option<&'static str> {
    match name {
        "admin" => Some(ROLE_ADMIN),
        "spaceadmin" => Some(ROLE_SPACE_ADMIN),
        "user" => Some(ROLE_USER),
        "user-light" => Some(ROLE_USER_LIGHT),
        _ => None,
    }
}

/// Attaches role assignments to a resolved user.
#[async_trait]
pub trait RoleAssigner: Send + Sync {
    /// Bring the stored assignment in line with the claims and attach it.
    async fn update_user_role_assignment(
        &self,
        user: User,
        claims: &Claims,
    ) -> Result<User, IdentityError>;

    /// Attach the stored assignment without changing it.
    async fn apply_user_role(&self, user: User) -> Result<User, IdentityError>;
}

async fn attach_roles(roles: &dyn RoleService, mut user: User) -> Result<User, IdentityError> {
    user.roles = roles.list_role_assignments(&user.id).await?;
    Ok(user)
}

/// Gives users without any role the `user` role.
pub struct DefaultRoleAssigner {
    roles: Arc<dyn RoleService>,
}

impl DefaultRoleAssigner {
    /// Create the assigner.
    pub fn new(roles: Arc<dyn RoleService>) -> Self {
        Self { roles }
    }
}

#[async_trait]
impl RoleAssigner for DefaultRoleAssigner {
    async fn update_user_role_assignment(
        &self,
        mut user: User,
        _claims: &Claims,
    ) -> Result<User, IdentityError> {
        let assigned = self.roles.list_role_assignments(&user.id).await?;
        if assigned.is_empty() {
            debug!(user_id = %user.id, "Assigning default role");
            self.roles.assign_role_to_user(&user.id, ROLE_USER).await?;
            user.roles = vec![ROLE_USER.to_string()];
        } else {
            user.roles = assigned;
        }
        Ok(user)
    }

    async fn apply_user_role(&self, user: User) -> Result<User, IdentityError> {
        attach_roles(self.roles.as_ref(), user).await
    }
}

/// Derives the role from a claim through an ordered mapping.
pub struct OidcRoleAssigner {
    roles: Arc<dyn RoleService>,
    role_claim: String,
    mapping: Vec<(String, &'static str)>,
}

impl OidcRoleAssigner {
    /// Create the assigner. Every mapped role name must be a well-known role.
    pub fn new(
        roles: Arc<dyn RoleService>,
        config: &OidcRoleMapperConfig,
    ) -> Result<Self, IdentityError> {
        let mapping = config
            .role_mapping
            .iter()
            .map(|m| {
                role_id_by_name(&m.role_name)
                    .map(|id| (m.claim_value.clone(), id))
                    .ok_or_else(|| {
                        IdentityError::RoleAssignment(format!("unknown role '{}'", m.role_name))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            roles,
            role_claim: config.role_claim.clone(),
            mapping,
        })
    }

    fn role_from_claims(&self, claims: &Claims) -> Option<&'static str> {
        let values = claims.get_strings(&self.role_claim);
        self.mapping
            .iter()
            .find(|(claim_value, _)| values.iter().any(|v| v == claim_value))
            .map(|(_, id)| *id)
    }
}

#[async_trait]
impl RoleAssigner for OidcRoleAssigner {
    async fn update_user_role_assignment(
        &self,
        mut user: User,
        claims: &Claims,
    ) -> Result<User, IdentityError> {
        let Some(role_id) = self.role_from_claims(claims) else {
            error!(
                user_id = %user.id,
                claim = %self.role_claim,
                "No role mapping matches the user's claims"
            );
            return Err(IdentityError::RoleAssignment(format!(
                "no mapping matched claim '{}'",
                self.role_claim
            )));
        };

        let assigned = self.roles.list_role_assignments(&user.id).await?;
        if assigned.len() != 1 || assigned[0] != role_id {
            debug!(user_id = %user.id, role_id = %role_id, "Updating role assignment from claims");
            self.roles.assign_role_to_user(&user.id, role_id).await?;
        }
        user.roles = vec![role_id.to_string()];
        Ok(user)
    }

    async fn apply_user_role(&self, user: User) -> Result<User, IdentityError> {
        attach_roles(self.roles.as_ref(), user).await
    }
}

/// Build the configured role assigner.
pub fn build_role_assigner(
    config: &RoleAssignmentConfig,
    roles: Arc<dyn RoleService>,
) -> Result<Arc<dyn RoleAssigner>, IdentityError> {
    Ok(match config.driver {
        RoleDriver::Default => Arc::new(DefaultRoleAssigner::new(roles)),
        RoleDriver::Oidc => Arc::new(OidcRoleAssigner::new(roles, &config.oidc_role_mapper)?),
    })
}
