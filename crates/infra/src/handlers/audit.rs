use async_trait::async_trait;
use tracing::info;

use fieldops_events::LogEntry;

use super::{Handler, HandlerContext};

/// Writes one structured audit record per captured entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditLog;

#[async_trait]
impl Handler for AuditLog {
    fn name(&self) -> &str {
        "audit_log"
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, entry: &LogEntry) -> anyhow::Result<()> {
        info!(
            target: "fieldops::audit",
            tenant = %ctx.tenant,
            actor = %entry.actor_name,
            actor_id = ?entry.actor_id,
            operation = %entry.operation,
            node_type = entry.node_type().unwrap_or_default(),
            node_id = ?entry.node_id(),
            at = %entry.timestamp,
            "entity mutated"
        );
        Ok(())
    }
}
