//! Handlers run by the event processor for each captured entry.
//!
//! Every handler invocation gets its own transaction (see
//! [`crate::processor`]); `ctx.client` is bound to it.

pub mod activity;
pub mod audit;
pub mod triggers;

use std::sync::Arc;

use async_trait::async_trait;

use fieldops_auth::{Identity, PermissionSet};
use fieldops_core::Tenant;
use fieldops_events::LogEntry;

use crate::store::Client;

pub use activity::{ChangeHistory, derive_activities};
pub use audit::AuditLog;
pub use triggers::{RuleTriggers, Trigger, TriggerOp, TriggerRegistry};

/// Request-scoped context of one handler invocation.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    pub tenant: &'a Tenant,
    /// Impersonated identity the processor acts as.
    pub identity: &'a Identity,
    pub permissions: &'a PermissionSet,
    /// Client bound to this invocation's transaction.
    pub client: &'a dyn Client,
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used in logs and error context.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &HandlerContext<'_>, entry: &LogEntry) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, entry: &LogEntry) -> anyhow::Result<()> {
        (**self).handle(ctx, entry).await
    }
}
