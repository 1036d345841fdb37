//! `fieldops-auth`: identities, roles and permission resolution.
//!
//! No HTTP or storage dependencies.

pub mod authorize;
pub mod identity;
pub mod permissions;
pub mod roles;

pub use authorize::{authorize, AuthzError, PermissionResolver, RolePermissionResolver};
pub use identity::{Actor, FeatureSet, Identity};
pub use permissions::{Permission, PermissionSet};
pub use roles::Role;
