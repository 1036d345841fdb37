//! Captured changes and entity snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use fieldops_core::{NodeId, UserId};

/// Event name under which captured mutations are published.
pub const MUTATION_EVENT: &str = "entity.mutation";

/// Kind of data-mutating operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Create,
    /// Multi-row update.
    Update,
    UpdateOne,
    /// Multi-row delete.
    Delete,
    DeleteOne,
}

impl Op {
    /// Whether the operation targets exactly one row.
    pub fn is_single(self) -> bool {
        matches!(self, Op::Create | Op::UpdateOne | Op::DeleteOne)
    }

    pub fn is_create(self) -> bool {
        self == Op::Create
    }

    pub fn is_update(self) -> bool {
        matches!(self, Op::Update | Op::UpdateOne)
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Op::Delete | Op::DeleteOne)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::UpdateOne => "update_one",
            Op::Delete => "delete",
            Op::DeleteOne => "delete_one",
        }
    }
}

impl core::fmt::Display for Op {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar field of a node snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Declared field type (e.g. "string", "time.Time", "int").
    #[serde(rename = "type")]
    pub kind: String,
    pub value: JsonValue,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// String view of the value; `None` for JSON null.
    pub fn as_string(&self) -> Option<String> {
        match &self.value {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// A named relation from a node to other nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub name: String,
    /// Node type on the other side of the relation.
    #[serde(rename = "type")]
    pub kind: String,
    pub ids: Vec<NodeId>,
}

impl Edge {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, ids: Vec<NodeId>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ids,
        }
    }

    pub fn first_id(&self) -> Option<NodeId> {
        self.ids.first().copied()
    }
}

/// Read-only snapshot of an entity: scalar fields plus related ids.
///
/// Snapshots are plain copies; they never alias live store records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Node {
    pub fn new(id: NodeId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            fields: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.set_field(field);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.set_edge(edge);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn edge(&self, name: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.name == name)
    }

    /// First related id of the named edge, if the edge exists and is non-empty.
    pub fn first_edge_id(&self, name: &str) -> Option<NodeId> {
        self.edge(name).and_then(Edge::first_id)
    }

    /// String value of the named field, if present and non-null.
    pub fn string_field(&self, name: &str) -> Option<String> {
        self.field(name).and_then(Field::as_string)
    }

    /// Insert or replace a field, keeping declaration order stable.
    pub fn set_field(&mut self, field: Field) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    /// Insert or replace an edge. An edge with no ids is removed.
    pub fn set_edge(&mut self, edge: Edge) {
        if edge.ids.is_empty() {
            self.edges.retain(|e| e.name != edge.name);
            return;
        }
        match self.edges.iter_mut().find(|e| e.name == edge.name) {
            Some(existing) => *existing = edge,
            None => self.edges.push(edge),
        }
    }
}

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("encoding log entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decoding log entry: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("malformed log entry: {0}")]
    Malformed(&'static str),
}

/// The unit of captured change.
///
/// Transient: built by the capture hook, serialized onto the bus,
/// decoded by the processor and then discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub actor_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    pub operation: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<Node>,
}

impl LogEntry {
    pub fn new(actor_name: impl Into<String>, actor_id: Option<UserId>, operation: Op) -> Self {
        Self {
            actor_name: actor_name.into(),
            actor_id,
            timestamp: Utc::now(),
            operation,
            previous_state: None,
            current_state: None,
        }
    }

    /// The snapshot that identifies the affected entity (current, else previous).
    pub fn node(&self) -> Option<&Node> {
        self.current_state.as_ref().or(self.previous_state.as_ref())
    }

    pub fn node_type(&self) -> Option<&str> {
        self.node().map(|n| n.kind.as_str())
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node().map(|n| n.id)
    }

    /// Check the snapshot invariants.
    ///
    /// At least one snapshot is present, and both are present only for
    /// updates. Creates have no previous state and deletes no current state.
    pub fn validate(&self) -> Result<(), EntryError> {
        match (&self.previous_state, &self.current_state) {
            (None, None) => Err(EntryError::Malformed("entry carries no snapshot")),
            (Some(_), Some(_)) if !self.operation.is_update() => Err(EntryError::Malformed(
                "both snapshots present on a non-update operation",
            )),
            (Some(_), _) if self.operation.is_create() => {
                Err(EntryError::Malformed("create carries a previous state"))
            }
            (_, Some(_)) if self.operation.is_delete() => {
                Err(EntryError::Malformed("delete carries a current state"))
            }
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EntryError> {
        serde_json::to_vec(self).map_err(EntryError::Encode)
    }

    /// Decode and validate an entry received from the bus.
    pub fn decode(body: &[u8]) -> Result<Self, EntryError> {
        let entry: LogEntry = serde_json::from_slice(body).map_err(EntryError::Decode)?;
        entry.validate()?;
        Ok(entry)
    }
}
