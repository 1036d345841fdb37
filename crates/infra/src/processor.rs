//! Tenant event processor.
//!
//! For every dispatched message: resolve the tenant database, impersonate the
//! automation identity, decode the [`LogEntry`] and run each handler, in
//! registration order, inside a transaction of its own.
//!
//! - Handler error: roll back, stop, return the error
//! - Handler panic: roll back, then resume the panic
//! - Success: commit (commit failure is returned)

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, instrument};

use fieldops_auth::{AuthzError, FeatureSet, Identity, PermissionResolver, PermissionSet, Role};
use fieldops_core::{DomainError, Tenant};
use fieldops_events::{EntryError, EventHandler, LogEntry};

use crate::handlers::{Handler, HandlerContext};
use crate::store::{Database, StoreError};
use crate::tenancy::{Tenancy, TenancyError};

/// Service name of the impersonated automation identity.
pub const SERVICE_NAME: &str = "fieldops-async";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid tenant name '{tenant}': {source}")]
    InvalidTenant { tenant: String, source: DomainError },

    #[error("resolving database of tenant '{tenant}': {source}")]
    Tenancy { tenant: String, source: TenancyError },

    #[error("resolving permissions in tenant '{tenant}': {source}")]
    Permissions { tenant: String, source: AuthzError },

    #[error(transparent)]
    Decode(#[from] EntryError),

    #[error("beginning transaction for handler {handler}: {source}")]
    Begin { handler: String, source: StoreError },

    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("committing transaction of handler {handler}: {source}")]
    Commit { handler: String, source: StoreError },
}

pub struct EventProcessor {
    tenancy: Arc<dyn Tenancy>,
    permissions: Arc<dyn PermissionResolver>,
    handlers: Vec<Arc<dyn Handler>>,
    service: String,
    role: Role,
    features: FeatureSet,
}

impl EventProcessor {
    pub fn new(tenancy: Arc<dyn Tenancy>, permissions: Arc<dyn PermissionResolver>) -> Self {
        Self {
            tenancy,
            permissions,
            handlers: Vec::new(),
            service: SERVICE_NAME.to_string(),
            role: Role::OWNER,
            features: FeatureSet::default(),
        }
    }

    /// Append a handler; handlers run in the order they were added.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Feature flags granted to the automation identity.
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>, role: Role) -> Self {
        self.service = service.into();
        self.role = role;
        self
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    #[instrument(skip(self, body), fields(bytes = body.len()), err)]
    pub async fn process(&self, tenant: &str, body: &[u8]) -> Result<(), ProcessError> {
        let tenant = Tenant::parse(tenant).map_err(|source| ProcessError::InvalidTenant {
            tenant: tenant.to_string(),
            source,
        })?;

        let db = self
            .tenancy
            .client_for(&tenant)
            .await
            .map_err(|source| ProcessError::Tenancy {
                tenant: tenant.to_string(),
                source,
            })?;

        let identity = Identity::automation(tenant.clone(), self.service.clone(), self.role.clone())
            .with_features(self.features.clone());
        let permissions =
            self.permissions
                .permissions_for(&identity)
                .map_err(|source| ProcessError::Permissions {
                    tenant: tenant.to_string(),
                    source,
                })?;

        let entry = LogEntry::decode(body)?;

        for handler in &self.handlers {
            self.run_handler(handler.as_ref(), db.as_ref(), &tenant, &identity, &permissions, &entry)
                .await?;
        }
        Ok(())
    }

    async fn run_handler(
        &self,
        handler: &dyn Handler,
        db: &dyn Database,
        tenant: &Tenant,
        identity: &Identity,
        permissions: &PermissionSet,
        entry: &LogEntry,
    ) -> Result<(), ProcessError> {
        let name = handler.name();
        let tx = db.begin().await.map_err(|source| ProcessError::Begin {
            handler: name.to_string(),
            source,
        })?;
        let ctx = HandlerContext {
            tenant,
            identity,
            permissions,
            client: tx.as_client(),
        };

        match AssertUnwindSafe(handler.handle(&ctx, entry)).catch_unwind().await {
            Ok(Ok(())) => {
                tx.commit().await.map_err(|source| ProcessError::Commit {
                    handler: name.to_string(),
                    source,
                })?;
                debug!(tenant = %tenant, handler = name, "handler committed");
                Ok(())
            }
            Ok(Err(err)) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(tenant = %tenant, handler = name, error = %rollback, "rollback failed");
                }
                Err(ProcessError::Handler {
                    handler: name.to_string(),
                    source: err.into(),
                })
            }
            Err(panic) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(tenant = %tenant, handler = name, error = %rollback, "rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[async_trait]
impl EventHandler for EventProcessor {
    async fn handle(&self, tenant: &str, _name: &str, body: &[u8]) -> anyhow::Result<()> {
        Ok(self.process(tenant, body).await?)
    }
}
