use core::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fieldops_core::{NodeId, UserId};
use fieldops_events::{Edge, Field, Node, Op};

/// Deferred work registered on a transaction, run once it has committed.
pub type CommitHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A single write against a tenant database.
///
/// `ids` is empty for `Create`, holds exactly one id for `UpdateOne` and
/// `DeleteOne`, and any number for the bulk variants.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub op: Op,
    pub node_type: String,
    pub ids: Vec<NodeId>,
    pub fields: Vec<Field>,
    pub edges: Vec<Edge>,
}

impl Mutation {
    fn new(op: Op, node_type: impl Into<String>, ids: Vec<NodeId>) -> Self {
        Self {
            op,
            node_type: node_type.into(),
            ids,
            fields: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn create(node_type: impl Into<String>) -> Self {
        Self::new(Op::Create, node_type, Vec::new())
    }

    pub fn update_one(node_type: impl Into<String>, id: NodeId) -> Self {
        Self::new(Op::UpdateOne, node_type, vec![id])
    }

    pub fn update(node_type: impl Into<String>, ids: Vec<NodeId>) -> Self {
        Self::new(Op::Update, node_type, ids)
    }

    pub fn delete_one(node_type: impl Into<String>, id: NodeId) -> Self {
        Self::new(Op::DeleteOne, node_type, vec![id])
    }

    pub fn delete(node_type: impl Into<String>, ids: Vec<NodeId>) -> Self {
        Self::new(Op::Delete, node_type, ids)
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Set (or, with no ids, clear) a relation.
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// The row targeted by a single-row update or delete.
    pub fn target(&self) -> Option<NodeId> {
        match self.op {
            Op::UpdateOne | Op::DeleteOne => self.ids.first().copied(),
            _ => None,
        }
    }

    /// Reject id sets that do not fit the operation.
    pub fn validate(&self) -> Result<(), StoreError> {
        match self.op {
            Op::Create if !self.ids.is_empty() => Err(StoreError::InvalidMutation(
                "create must not name target ids".to_string(),
            )),
            Op::UpdateOne | Op::DeleteOne if self.ids.len() != 1 => Err(StoreError::InvalidMutation(
                format!("{} requires exactly one target id, got {}", self.op, self.ids.len()),
            )),
            _ if self.node_type.is_empty() => Err(StoreError::InvalidMutation(
                "node type is required".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Apply this mutation's field and edge changes to a node copy.
    pub fn patch(&self, node: &mut Node) {
        for field in &self.fields {
            node.set_field(field.clone());
        }
        for edge in &self.edges {
            node.set_edge(edge.clone());
        }
    }
}

/// Result of applying a [`Mutation`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutationOutcome {
    /// Rows touched (the created row for `Create`).
    pub ids: Vec<NodeId>,
    pub affected: usize,
}

impl MutationOutcome {
    pub fn new(ids: Vec<NodeId>) -> Self {
        let affected = ids.len();
        Self { ids, affected }
    }

    /// First touched row; the new id for a create.
    pub fn id(&self) -> Option<NodeId> {
        self.ids.first().copied()
    }
}

/// Work-order attribute tracked by change history.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangedField {
    CreationDate,
    Assignee,
    Owner,
    Status,
    Priority,
}

impl ChangedField {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangedField::CreationDate => "CREATION_DATE",
            ChangedField::Assignee => "ASSIGNEE",
            ChangedField::Owner => "OWNER",
            ChangedField::Status => "STATUS",
            ChangedField::Priority => "PRIORITY",
        }
    }
}

impl core::fmt::Display for ChangedField {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangedField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CREATION_DATE" => ChangedField::CreationDate,
            "ASSIGNEE" => ChangedField::Assignee,
            "OWNER" => ChangedField::Owner,
            "STATUS" => ChangedField::Status,
            "PRIORITY" => ChangedField::Priority,
            other => return Err(StoreError::Database(format!("unknown changed field '{other}'"))),
        })
    }
}

/// An activity row to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewActivity {
    pub changed_field: ChangedField,
    pub is_create: bool,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub author_id: Option<UserId>,
    pub work_order_id: NodeId,
}

/// A persisted change-history row. Created only; never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub changed_field: ChangedField,
    pub is_create: bool,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub author_id: Option<UserId>,
    pub work_order_id: NodeId,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn from_new(id: i64, new: NewActivity, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            changed_field: new.changed_field,
            is_create: new.is_create,
            old_value: new.old_value,
            new_value: new.new_value,
            author_id: new.author_id,
            work_order_id: new.work_order_id,
            created_at,
        }
    }
}

/// Store operation error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("transaction already committed or rolled back")]
    TxClosed,

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Tenant-scoped data access.
///
/// Reads through `node` are privileged: no authorization is applied.
#[async_trait]
pub trait Client: Send + Sync {
    /// Snapshot of the current state of a node.
    async fn node(&self, id: NodeId) -> Result<Node, StoreError>;

    async fn apply(&self, mutation: &Mutation) -> Result<MutationOutcome, StoreError>;

    async fn create_activity(&self, activity: NewActivity) -> Result<Activity, StoreError>;

    /// Activities of one work order, oldest first.
    async fn activities(&self, work_order: NodeId) -> Result<Vec<Activity>, StoreError>;

    /// Run `hook` once the enclosing transaction commits, or immediately when
    /// there is none.
    async fn on_commit(&self, hook: CommitHook) -> Result<(), StoreError>;
}

/// A tenant database: a non-transactional client that can open transactions.
#[async_trait]
pub trait Database: Client {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    fn as_client(&self) -> &dyn Client;
}

/// A client bound to one open transaction.
///
/// After `commit` or `rollback` every operation fails with
/// [`StoreError::TxClosed`]. Commit hooks run in registration order after a
/// successful commit and are discarded on rollback.
#[async_trait]
pub trait Transaction: Client {
    async fn commit(&self) -> Result<(), StoreError>;

    async fn rollback(&self) -> Result<(), StoreError>;

    fn as_client(&self) -> &dyn Client;
}

pub(crate) async fn run_hooks(hooks: Vec<CommitHook>) {
    for hook in hooks {
        hook().await;
    }
}
