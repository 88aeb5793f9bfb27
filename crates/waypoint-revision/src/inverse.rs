use chrono::NaiveTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use waypoint_schema::{
    ChangeDetail, ChangeOperation, Edge, ElementType, Node, NodeId, NodeKind, NodePatch,
    OperationKind, RevisionRecord,
};

#[derive(Deserialize)]
struct Timing {
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
}

/// Operations that undo `record`, in the order they must be applied.
pub fn inverse_operations(record: &RevisionRecord) -> Result<Vec<ChangeOperation>, String> {
    record.changes.iter().rev().map(invert).collect()
}

fn invert(detail: &ChangeDetail) -> Result<ChangeOperation, String> {
    let day = Some(detail.day);
    match (detail.op, detail.element) {
        (OperationKind::Insert, ElementType::Node) => Ok(ChangeOperation::Delete {
            node_id: detail.element_id.clone(),
        }),
        (OperationKind::Delete, ElementType::Node) => Ok(ChangeOperation::Insert {
            day,
            after: detail.anchor.clone(),
            node: decode::<Node>(detail, &detail.old_value)?,
        }),
        (OperationKind::Delete | OperationKind::Disconnect, ElementType::Edge) => {
            Ok(ChangeOperation::Connect {
                day,
                edge: decode::<Edge>(detail, &detail.old_value)?,
            })
        }
        (OperationKind::Connect, ElementType::Edge) => {
            let edge = decode::<Edge>(detail, &detail.new_value)?;
            Ok(ChangeOperation::Disconnect {
                day,
                from: edge.from,
                to: edge.to,
            })
        }
        (OperationKind::Move, ElementType::Node) => {
            let timing = decode::<Timing>(detail, &detail.old_value)?;
            Ok(ChangeOperation::Move {
                node_id: detail.element_id.clone(),
                start: timing.start,
                end: timing.end,
            })
        }
        (OperationKind::Reorder, ElementType::Day) => Ok(ChangeOperation::Reorder {
            day,
            node_ids: decode::<Vec<NodeId>>(detail, &detail.old_value)?,
        }),
        (OperationKind::Update, ElementType::Node) => Ok(ChangeOperation::Update {
            node_id: detail.element_id.clone(),
            patch: restore_field(detail)?,
        }),
        (op, element) => Err(format!(
            "cannot invert {op} on {element:?} {}",
            detail.element_id
        )),
    }
}

fn restore_field(detail: &ChangeDetail) -> Result<NodePatch, String> {
    let mut patch = NodePatch::default();
    match detail.field_path.as_deref() {
        Some("title") => patch.title = Some(decode::<String>(detail, &detail.old_value)?),
        Some("kind") => patch.kind = Some(decode::<NodeKind>(detail, &detail.old_value)?),
        Some("place_id") => {
            patch.place_id = Some(decode::<Option<String>>(detail, &detail.old_value)?)
        }
        Some("notes") => patch.notes = Some(decode::<Option<String>>(detail, &detail.old_value)?),
        Some("locked") => patch.locked = Some(decode::<bool>(detail, &detail.old_value)?),
        other => {
            return Err(format!(
                "cannot restore field {other:?} of node {}",
                detail.element_id
            ))
        }
    }
    Ok(patch)
}

fn decode<T: DeserializeOwned>(detail: &ChangeDetail, value: &Option<Value>) -> Result<T, String> {
    let value = value.clone().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        format!(
            "revision entry for {} {} is unreadable: {e}",
            detail.op, detail.element_id
        )
    })
}
