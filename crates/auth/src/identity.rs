//! Request-scoped identities.
//!
//! An [`Identity`] is passed explicitly through call chains (mutation
//! context, handler context) instead of living in ambient state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use fieldops_core::{Tenant, UserId};

use crate::Role;

/// Feature flags enabled for an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(BTreeSet<String>);

impl FeatureSet {
    pub fn new<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(flags.into_iter().map(Into::into).collect())
    }

    pub fn enabled(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Who is acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// A human user authenticated by the API layer.
    User { id: UserId, email: String },
    /// A synthetic service actor impersonated by background processes.
    Automation { service: String },
}

/// Authenticated (or impersonated) identity acting within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    tenant: Tenant,
    actor: Actor,
    role: Role,
    features: FeatureSet,
}

impl Identity {
    pub fn user(tenant: Tenant, id: UserId, email: impl Into<String>, role: Role) -> Self {
        Self {
            tenant,
            actor: Actor::User {
                id,
                email: email.into(),
            },
            role,
            features: FeatureSet::default(),
        }
    }

    /// Impersonated identity used when the system acts on its own behalf.
    pub fn automation(tenant: Tenant, service: impl Into<String>, role: Role) -> Self {
        Self {
            tenant,
            actor: Actor::Automation {
                service: service.into(),
            },
            role,
            features: FeatureSet::default(),
        }
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Display name recorded on captured changes.
    pub fn name(&self) -> &str {
        match &self.actor {
            Actor::User { email, .. } => email,
            Actor::Automation { service } => service,
        }
    }

    /// Backing user id, if this identity is a human user.
    pub fn user_id(&self) -> Option<UserId> {
        match &self.actor {
            Actor::User { id, .. } => Some(*id),
            Actor::Automation { .. } => None,
        }
    }

    pub fn is_automation(&self) -> bool {
        matches!(self.actor, Actor::Automation { .. })
    }
}
