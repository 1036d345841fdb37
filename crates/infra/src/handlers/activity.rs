//! Work-order change history.
//!
//! Diffs the before/after snapshots of a work order into field-level
//! [`NewActivity`] records for a fixed set of tracked attributes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use fieldops_auth::{Permission, authorize};
use fieldops_core::UserId;
use fieldops_events::{LogEntry, Node, Op};

use super::{Handler, HandlerContext};
use crate::store::{ChangedField, NewActivity};

/// Entity kind whose changes are tracked.
pub const WORK_ORDER: &str = "WorkOrder";

/// Feature flag gating change-history derivation.
pub const FEATURE_FLAG: &str = "work_order_activities";

pub const FIELD_CREATION_DATE: &str = "creation_date";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_PRIORITY: &str = "priority";
pub const EDGE_ASSIGNEE: &str = "assignee";
pub const EDGE_OWNER: &str = "owner";

/// Permission needed to write activity rows.
pub const WRITE_ACTIVITY: &str = "work_order.activity.write";

/// Tracked attributes in record order.
const TRACKED: [(ChangedField, Attr); 4] = [
    (ChangedField::Assignee, Attr::Edge(EDGE_ASSIGNEE)),
    (ChangedField::Owner, Attr::Edge(EDGE_OWNER)),
    (ChangedField::Status, Attr::Field(FIELD_STATUS)),
    (ChangedField::Priority, Attr::Field(FIELD_PRIORITY)),
];

#[derive(Debug, Clone, Copy)]
enum Attr {
    /// First related id of the named edge.
    Edge(&'static str),
    /// String value of the named field.
    Field(&'static str),
}

impl Attr {
    fn read(self, node: Option<&Node>) -> Option<String> {
        let node = node?;
        match self {
            Attr::Edge(name) => node.first_edge_id(name).map(|id| id.to_string()),
            Attr::Field(name) => node.string_field(name),
        }
    }
}

/// Records describing `entry`, in creation order.
///
/// - `Create`: one creation-date record, plus one per tracked attribute set
///   on the new node; all `is_create`, no old values.
/// - `Update`/`UpdateOne`: one record per tracked attribute whose value (or
///   presence) differs; needs both snapshots.
/// - Anything else, or another entity kind: nothing.
pub fn derive_activities(entry: &LogEntry) -> Vec<NewActivity> {
    if entry.node_type() != Some(WORK_ORDER) {
        return Vec::new();
    }

    match entry.operation {
        Op::Create => entry
            .current_state
            .as_ref()
            .map(|node| created(entry, node))
            .unwrap_or_default(),
        Op::Update | Op::UpdateOne => match (&entry.previous_state, &entry.current_state) {
            (Some(before), Some(after)) => updated(entry.actor_id, before, after),
            _ => Vec::new(),
        },
        Op::Delete | Op::DeleteOne => Vec::new(),
    }
}

fn created(entry: &LogEntry, node: &Node) -> Vec<NewActivity> {
    let record = |changed_field, new_value| NewActivity {
        changed_field,
        is_create: true,
        old_value: None,
        new_value: Some(new_value),
        author_id: entry.actor_id,
        work_order_id: node.id,
    };

    let mut records = vec![record(
        ChangedField::CreationDate,
        creation_date(node, entry.timestamp),
    )];
    records.extend(
        TRACKED
            .iter()
            .filter_map(|&(changed_field, attr)| {
                attr.read(Some(node)).map(|value| record(changed_field, value))
            }),
    );
    records
}

fn updated(author_id: Option<UserId>, before: &Node, after: &Node) -> Vec<NewActivity> {
    TRACKED
        .iter()
        .filter_map(|&(changed_field, attr)| {
            let old_value = attr.read(Some(before));
            let new_value = attr.read(Some(after));
            (old_value != new_value).then(|| NewActivity {
                changed_field,
                is_create: false,
                old_value,
                new_value,
                author_id,
                work_order_id: after.id,
            })
        })
        .collect()
}

/// Unix seconds of the node's creation date, falling back to `fallback`.
fn creation_date(node: &Node, fallback: DateTime<Utc>) -> String {
    let seconds = node
        .field(FIELD_CREATION_DATE)
        .and_then(|field| match &field.value {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp()),
            _ => None,
        })
        .unwrap_or_else(|| fallback.timestamp());
    seconds.to_string()
}

/// Persists derived change history for work orders.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeHistory;

#[async_trait]
impl Handler for ChangeHistory {
    fn name(&self) -> &str {
        "change_history"
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, entry: &LogEntry) -> anyhow::Result<()> {
        if !ctx.identity.features().enabled(FEATURE_FLAG) {
            return Ok(());
        }

        let records = derive_activities(entry);
        if records.is_empty() {
            return Ok(());
        }
        authorize(ctx.permissions, &Permission::new(WRITE_ACTIVITY))?;

        debug!(
            tenant = %ctx.tenant,
            work_order = ?entry.node_id(),
            count = records.len(),
            "recording work order activities"
        );
        for record in records {
            ctx.client.create_activity(record).await?;
        }
        Ok(())
    }
}
