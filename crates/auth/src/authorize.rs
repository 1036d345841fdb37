use std::collections::HashMap;

use thiserror::Error;

use crate::{Identity, Permission, PermissionSet, Role};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("no permissions defined for role '{0}'")]
    UnknownRole(String),
}

/// Resolves the effective permission set of an identity.
///
/// The policy source is an external collaborator; implementations may be
/// static tables (see [`RolePermissionResolver`]) or storage-backed.
pub trait PermissionResolver: Send + Sync {
    fn permissions_for(&self, identity: &Identity) -> Result<PermissionSet, AuthzError>;
}

/// Static role → permissions table.
#[derive(Debug, Clone)]
pub struct RolePermissionResolver {
    roles: HashMap<Role, PermissionSet>,
}

impl RolePermissionResolver {
    pub fn new() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    pub fn with_role(
        mut self,
        role: Role,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        self.roles.insert(role, PermissionSet::new(permissions));
        self
    }
}

impl Default for RolePermissionResolver {
    /// `owner` and `admin` get the wildcard, `user` gets read access.
    fn default() -> Self {
        Role::BUILT_IN.into_iter().fold(Self::new(), |resolver, role| {
            let granted = if role.manages_tenant() {
                Permission::WILDCARD
            } else {
                Permission::new("read")
            };
            resolver.with_role(role, [granted])
        })
    }
}

impl PermissionResolver for RolePermissionResolver {
    fn permissions_for(&self, identity: &Identity) -> Result<PermissionSet, AuthzError> {
        self.roles
            .get(identity.role())
            .cloned()
            .ok_or_else(|| AuthzError::UnknownRole(identity.role().to_string()))
    }
}

/// Check a resolved permission set against a required permission.
///
/// - No IO
/// - No panics
pub fn authorize(permissions: &PermissionSet, required: &Permission) -> Result<(), AuthzError> {
    if permissions.allows(required) {
        Ok(())
    } else {
        tracing::debug!(permission = %required, "authorization denied");
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}
