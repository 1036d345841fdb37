//! Business-rule triggers.
//!
//! Only the invocation contract lives here: a [`TriggerRegistry`] maps
//! `(node type, operation kind)` to triggers, and [`RuleTriggers`] fires them
//! in registration order. Action implementations are supplied by callers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::debug;

use fieldops_events::{LogEntry, Op};

use super::{Handler, HandlerContext};

/// Operation kind a trigger reacts to (single and bulk variants alike).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TriggerOp {
    Created,
    Updated,
    Deleted,
}

impl From<Op> for TriggerOp {
    fn from(op: Op) -> Self {
        match op {
            Op::Create => TriggerOp::Created,
            Op::Update | Op::UpdateOne => TriggerOp::Updated,
            Op::Delete | Op::DeleteOne => TriggerOp::Deleted,
        }
    }
}

#[async_trait]
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    /// Runs inside the handler's transaction; an error rolls it back.
    async fn fire(&self, ctx: &HandlerContext<'_>, entry: &LogEntry) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct TriggerRegistry {
    triggers: HashMap<(String, TriggerOp), Vec<Arc<dyn Trigger>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        node_type: impl Into<String>,
        op: TriggerOp,
        trigger: Arc<dyn Trigger>,
    ) -> Self {
        self.triggers
            .entry((node_type.into(), op))
            .or_default()
            .push(trigger);
        self
    }

    pub fn triggers_for(&self, node_type: &str, op: TriggerOp) -> &[Arc<dyn Trigger>] {
        self.triggers
            .get(&(node_type.to_string(), op))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

/// Fires registered triggers for each entry.
#[derive(Clone)]
pub struct RuleTriggers {
    registry: Arc<TriggerRegistry>,
}

impl RuleTriggers {
    pub fn new(registry: Arc<TriggerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler for RuleTriggers {
    fn name(&self) -> &str {
        "rule_triggers"
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, entry: &LogEntry) -> anyhow::Result<()> {
        let Some(node_type) = entry.node_type() else {
            return Ok(());
        };

        for trigger in self.registry.triggers_for(node_type, entry.operation.into()) {
            debug!(tenant = %ctx.tenant, node_type, trigger = trigger.name(), "firing trigger");
            trigger
                .fire(ctx, entry)
                .await
                .with_context(|| format!("trigger {}", trigger.name()))?;
        }
        Ok(())
    }
}
