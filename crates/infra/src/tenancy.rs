//! Tenant → database resolution.
//!
//! Each tenant owns its own logical database. Resolution is done per message
//! by the event processor; implementations cache pools so that is cheap.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

use fieldops_core::Tenant;

use crate::store::{Database, InMemoryDatabase, PostgresDatabase, StoreError};

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("unknown tenant '{0}'")]
    UnknownTenant(Tenant),

    #[error("connecting to database of tenant '{tenant}': {message}")]
    Connect { tenant: Tenant, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait Tenancy: Send + Sync {
    async fn client_for(&self, tenant: &Tenant) -> Result<Arc<dyn Database>, TenancyError>;
}

#[async_trait]
impl<T> Tenancy for Arc<T>
where
    T: Tenancy + ?Sized,
{
    async fn client_for(&self, tenant: &Tenant) -> Result<Arc<dyn Database>, TenancyError> {
        (**self).client_for(tenant).await
    }
}

/// In-memory tenancy for tests/dev.
///
/// Creates one [`InMemoryDatabase`] per tenant on first use, unless built with
/// [`InMemoryTenancy::with_tenants`], in which case other tenants are unknown.
#[derive(Debug, Default)]
pub struct InMemoryTenancy {
    allowed: Option<HashSet<Tenant>>,
    databases: RwLock<HashMap<Tenant, InMemoryDatabase>>,
}

impl InMemoryTenancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict resolution to a fixed set of tenants.
    pub fn with_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        Self {
            allowed: Some(tenants.into_iter().collect()),
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// The tenant's database, creating it if allowed.
    pub fn database(&self, tenant: &Tenant) -> Result<InMemoryDatabase, TenancyError> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(tenant) {
                return Err(TenancyError::UnknownTenant(tenant.clone()));
            }
        }

        let mut databases = self
            .databases
            .write()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))?;
        Ok(databases.entry(tenant.clone()).or_default().clone())
    }
}

#[async_trait]
impl Tenancy for InMemoryTenancy {
    async fn client_for(&self, tenant: &Tenant) -> Result<Arc<dyn Database>, TenancyError> {
        Ok(Arc::new(self.database(tenant)?))
    }
}

/// Postgres tenancy: tenant `acme` lives in database `tenant_acme` on the
/// server named by the base URL.
#[derive(Debug)]
pub struct PostgresTenancy {
    base_url: String,
    max_connections: u32,
    ensure_schema: bool,
    pools: AsyncRwLock<HashMap<Tenant, Arc<PostgresDatabase>>>,
}

impl PostgresTenancy {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            max_connections: 5,
            ensure_schema: false,
            pools: AsyncRwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Create the pipeline tables when a tenant database is first opened.
    pub fn with_schema_bootstrap(mut self, ensure_schema: bool) -> Self {
        self.ensure_schema = ensure_schema;
        self
    }

    /// Connection URL of a tenant's database.
    pub fn tenant_url(&self, tenant: &Tenant) -> String {
        let (base, query) = match self.base_url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (self.base_url.as_str(), None),
        };
        let mut url = format!("{}/{}", base.trim_end_matches('/'), database_name(tenant));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    async fn connect(&self, tenant: &Tenant) -> Result<Arc<PostgresDatabase>, TenancyError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.tenant_url(tenant))
            .await
            .map_err(|e| TenancyError::Connect {
                tenant: tenant.clone(),
                message: e.to_string(),
            })?;
        let database = PostgresDatabase::new(pool);
        if self.ensure_schema {
            database.ensure_schema().await?;
        }
        info!(tenant = %tenant, "opened tenant database pool");
        Ok(Arc::new(database))
    }
}

/// Database name of a tenant. Tenant names are already restricted to
/// characters that are safe here.
pub fn database_name(tenant: &Tenant) -> String {
    format!("tenant_{}", tenant.as_str())
}

#[async_trait]
impl Tenancy for PostgresTenancy {
    async fn client_for(&self, tenant: &Tenant) -> Result<Arc<dyn Database>, TenancyError> {
        if let Some(db) = self.pools.read().await.get(tenant) {
            return Ok(db.clone());
        }

        let mut pools = self.pools.write().await;
        // Another task may have connected while we waited for the lock.
        if let Some(db) = pools.get(tenant) {
            return Ok(db.clone());
        }
        let db = self.connect(tenant).await?;
        pools.insert(tenant.clone(), Arc::clone(&db));
        Ok(db)
    }
}
