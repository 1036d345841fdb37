use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Tenant membership role of a field-ops identity.
///
/// Every tenant knows the three built-in roles; anything else is a custom
/// role whose permissions must come from the
/// [`PermissionResolver`](crate::PermissionResolver) in use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Tenant owner. Also the role the automation identity runs as.
    pub const OWNER: Role = Role(Cow::Borrowed("owner"));
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    /// Field technician or dispatcher.
    pub const USER: Role = Role(Cow::Borrowed("user"));

    pub const BUILT_IN: [Role; 3] = [Role::OWNER, Role::ADMIN, Role::USER];

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_built_in(&self) -> bool {
        Self::BUILT_IN.contains(self)
    }

    /// Owners and admins manage every record of their tenant.
    pub fn manages_tenant(&self) -> bool {
        *self == Self::OWNER || *self == Self::ADMIN
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
