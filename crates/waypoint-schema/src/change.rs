use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{AgentKind, Edge, Node, NodeId, NodeKind};

/// Who originated an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    Agent {
        kind: AgentKind,
        #[serde(default)]
        task_id: Option<Uuid>,
    },
    User {
        user_id: String,
    },
    System,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
        }
    }

    pub fn agent(kind: AgentKind) -> Self {
        Self::Agent {
            kind,
            task_id: None,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent {
                kind,
                task_id: Some(task_id),
            } => write!(f, "agent:{kind}:{task_id}"),
            Self::Agent { kind, task_id: None } => write!(f, "agent:{kind}"),
            Self::User { user_id } => write!(f, "user:{user_id}"),
            Self::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ChangeScope {
    Trip,
    Day { day: u32 },
}

impl ChangeScope {
    pub fn day(&self) -> Option<u32> {
        match self {
            Self::Trip => None,
            Self::Day { day } => Some(*day),
        }
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Field-level node edit. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NodeKind>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub place_id: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.kind.is_none()
            && self.place_id.is_none()
            && self.notes.is_none()
            && self.locked.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert {
        #[serde(default)]
        day: Option<u32>,
        #[serde(default)]
        after: Option<NodeId>,
        node: Node,
    },
    Delete {
        node_id: NodeId,
    },
    Move {
        node_id: NodeId,
        #[serde(default)]
        start: Option<NaiveTime>,
        #[serde(default)]
        end: Option<NaiveTime>,
    },
    Reorder {
        #[serde(default)]
        day: Option<u32>,
        node_ids: Vec<NodeId>,
    },
    Update {
        node_id: NodeId,
        patch: NodePatch,
    },
    Connect {
        #[serde(default)]
        day: Option<u32>,
        edge: Edge,
    },
    Disconnect {
        #[serde(default)]
        day: Option<u32>,
        from: NodeId,
        to: NodeId,
    },
}

impl ChangeOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Insert { .. } => OperationKind::Insert,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Move { .. } => OperationKind::Move,
            Self::Reorder { .. } => OperationKind::Reorder,
            Self::Update { .. } => OperationKind::Update,
            Self::Connect { .. } => OperationKind::Connect,
            Self::Disconnect { .. } => OperationKind::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Delete,
    Move,
    Reorder,
    Update,
    Connect,
    Disconnect,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Reorder => "reorder",
            Self::Update => "update",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub scope: ChangeScope,
    pub operations: Vec<ChangeOperation>,
    #[serde(default, alias = "baseVersion")]
    pub base_version: Option<u64>,
    #[serde(default, alias = "idempotencyKey")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub reason: String,
    pub actor: Actor,
}

impl ChangeSet {
    pub fn new(scope: ChangeScope, actor: Actor) -> Self {
        Self {
            scope,
            operations: Vec::new(),
            base_version: None,
            idempotency_key: None,
            reason: String::new(),
            actor,
        }
    }

    pub fn with_op(mut self, op: ChangeOperation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn based_on(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Node,
    Edge,
    Day,
}

/// One field-level effect of an applied operation.
///
/// `anchor` records the predecessor node for inserts and deletes so the
/// position can be restored by an inverse edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDetail {
    pub op: OperationKind,
    pub element: ElementType,
    pub element_id: String,
    pub day: u32,
    #[serde(default)]
    pub field_path: Option<String>,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub anchor: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub day: u32,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub day: u32,
    pub node_id: NodeId,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRef {
    pub day: u32,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItineraryDiff {
    #[serde(default)]
    pub added: Vec<NodeRef>,
    #[serde(default)]
    pub removed: Vec<NodeRef>,
    #[serde(default)]
    pub updated: Vec<NodeUpdate>,
    /// Days whose surviving nodes changed relative order.
    #[serde(default)]
    pub reordered_days: Vec<u32>,
    #[serde(default)]
    pub edges_added: Vec<EdgeRef>,
    #[serde(default)]
    pub edges_removed: Vec<EdgeRef>,
}

impl ItineraryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.reordered_days.is_empty()
            && self.edges_added.is_empty()
            && self.edges_removed.is_empty()
    }

    pub fn added_ids(&self) -> Vec<&str> {
        self.added.iter().map(|r| r.node_id.as_str()).collect()
    }

    pub fn removed_ids(&self) -> Vec<&str> {
        self.removed.iter().map(|r| r.node_id.as_str()).collect()
    }

    pub fn updated_ids(&self) -> Vec<&str> {
        self.updated.iter().map(|u| u.node_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedOperation {
    pub index: usize,
    pub op: OperationKind,
    pub node_id: NodeId,
    pub reason: String,
}

/// Immutable, append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub revision_id: Uuid,
    pub from_version: u64,
    pub to_version: u64,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub changes: Vec<ChangeDetail>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub undo_of: Option<Uuid>,
    #[serde(default)]
    pub diff: ItineraryDiff,
    #[serde(default)]
    pub rejected: Vec<RejectedOperation>,
}

/// Wire message describing the delta between two itinerary versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEvent {
    pub itinerary_id: String,
    pub from_version: u64,
    pub to_version: u64,
    pub diff: ItineraryDiff,
    pub summary: String,
    pub updated_by: Actor,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_tagged_by_op() {
        let json = serde_json::json!({ "op": "delete", "node_id": "B" });
        let op: ChangeOperation = serde_json::from_value(json).unwrap();
        assert_eq!(
            op,
            ChangeOperation::Delete {
                node_id: "B".into()
            }
        );
        assert_eq!(op.kind(), OperationKind::Delete);
    }

    #[test]
    fn patch_null_clears_field() {
        let patch: NodePatch = serde_json::from_value(serde_json::json!({ "place_id": null })).unwrap();
        assert_eq!(patch.place_id, Some(None));

        let patch: NodePatch = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(patch.place_id, None);
        assert!(patch.is_empty());
    }

    #[test]
    fn actor_display() {
        assert_eq!(Actor::user("u1").to_string(), "user:u1");
        assert_eq!(Actor::agent(AgentKind::Planner).to_string(), "agent:planner");
        assert!(Actor::agent(AgentKind::Editor).is_agent());
    }
}
