//! Applies a change set to a working copy of an itinerary's days.
//!
//! Nothing here touches storage: the engine hands in the current document,
//! gets back the edited days plus the change log, and only persists when the
//! whole batch (and the validation pass after it) succeeded.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{json, Value};
use waypoint_schema::{
    ChangeDetail, ChangeOperation, ChangeScope, ChangeSet, Day, Edge, ElementType, Itinerary,
    Node, NodeId, NodePatch, OperationKind, RejectedOperation,
};

use crate::config::LockPolicy;

#[derive(Debug, Clone)]
pub struct AppliedChanges {
    pub days: Vec<Day>,
    pub changes: Vec<ChangeDetail>,
    pub rejected: Vec<RejectedOperation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyFailure {
    Invalid { index: Option<usize>, reason: String },
    Locked(Vec<RejectedOperation>),
}

pub fn apply_change_set(
    doc: &Itinerary,
    change_set: &ChangeSet,
    policy: LockPolicy,
) -> Result<AppliedChanges, ApplyFailure> {
    if change_set.operations.is_empty() {
        return Err(ApplyFailure::Invalid {
            index: None,
            reason: "change set has no operations".into(),
        });
    }

    let enforce_locks = doc.settings.respect_locks && change_set.actor.is_agent();
    let mut copy = WorkingCopy {
        days: doc.days.clone(),
        scope: change_set.scope,
    };
    let mut changes = Vec::new();
    let mut rejected = Vec::new();

    for (index, op) in change_set.operations.iter().enumerate() {
        if enforce_locks {
            if let Some(node_id) = copy.locked_target(op) {
                rejected.push(RejectedOperation {
                    index,
                    op: op.kind(),
                    reason: format!("node {node_id} is locked"),
                    node_id,
                });
                continue;
            }
        }
        let details = copy.apply(op).map_err(|reason| ApplyFailure::Invalid {
            index: Some(index),
            reason,
        })?;
        changes.extend(details);
    }

    if !rejected.is_empty()
        && (policy == LockPolicy::RejectChangeSet
            || rejected.len() == change_set.operations.len())
    {
        return Err(ApplyFailure::Locked(rejected));
    }

    validate_days(&copy.days).map_err(|reason| ApplyFailure::Invalid {
        index: None,
        reason,
    })?;

    Ok(AppliedChanges {
        days: copy.days,
        changes,
        rejected,
    })
}

/// Whole-document invariants checked after every batch.
pub fn validate_days(days: &[Day]) -> Result<(), String> {
    let mut day_numbers = HashSet::new();
    let mut node_ids = HashSet::new();

    for day in days {
        if !day_numbers.insert(day.number) {
            return Err(format!("day {} appears more than once", day.number));
        }
        let mut on_day = HashSet::new();
        for node in &day.nodes {
            if node.id.trim().is_empty() {
                return Err(format!("day {} has a node with an empty id", day.number));
            }
            if !node_ids.insert(node.id.as_str()) {
                return Err(format!("node id {} is not unique", node.id));
            }
            on_day.insert(node.id.as_str());
            if let (Some(start), Some(end)) = (node.start, node.end) {
                if start > end {
                    return Err(format!("node {} starts after it ends", node.id));
                }
            }
        }
        let mut edge_keys = HashSet::new();
        for edge in &day.edges {
            if !on_day.contains(edge.from.as_str()) || !on_day.contains(edge.to.as_str()) {
                return Err(format!(
                    "edge {} on day {} references a node not on that day",
                    edge_key(edge),
                    day.number
                ));
            }
            if !edge_keys.insert((edge.from.as_str(), edge.to.as_str())) {
                return Err(format!("duplicate edge {}", edge_key(edge)));
            }
        }
    }
    Ok(())
}

pub fn edge_key(edge: &Edge) -> String {
    format!("{}->{}", edge.from, edge.to)
}

fn to_value<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

struct WorkingCopy {
    days: Vec<Day>,
    scope: ChangeScope,
}

impl WorkingCopy {
    fn locate(&self, node_id: &str) -> Option<(usize, usize)> {
        self.days
            .iter()
            .enumerate()
            .find_map(|(di, d)| d.position(node_id).map(|pos| (di, pos)))
    }

    fn node(&self, node_id: &str) -> Option<&Node> {
        self.locate(node_id)
            .map(|(di, pos)| &self.days[di].nodes[pos])
    }

    fn day_index(&self, number: u32) -> Result<usize, String> {
        self.days
            .iter()
            .position(|d| d.number == number)
            .ok_or_else(|| format!("day {number} does not exist"))
    }

    fn in_scope(&self, day: u32) -> Result<(), String> {
        match self.scope.day() {
            Some(scoped) if scoped != day => Err(format!(
                "day {day} is outside the change set scope (day {scoped})"
            )),
            _ => Ok(()),
        }
    }

    /// Day for an operation: the explicit one, else the scoped day, else the
    /// day holding `fallback_node`.
    fn target_day(&self, explicit: Option<u32>, fallback_node: Option<&str>) -> Result<u32, String> {
        let day = explicit
            .or(self.scope.day())
            .or_else(|| {
                fallback_node
                    .and_then(|id| self.locate(id))
                    .map(|(di, _)| self.days[di].number)
            })
            .ok_or_else(|| "operation needs a day".to_string())?;
        self.in_scope(day)?;
        Ok(day)
    }

    fn find_node(&self, node_id: &str) -> Result<(usize, usize), String> {
        let (di, pos) = self
            .locate(node_id)
            .ok_or_else(|| format!("node {node_id} not found"))?;
        self.in_scope(self.days[di].number)?;
        Ok((di, pos))
    }

    /// The locked node an operation would touch, if any.
    fn locked_target(&self, op: &ChangeOperation) -> Option<NodeId> {
        let locked = |id: &str| self.node(id).map(|n| n.locked).unwrap_or(false);
        match op {
            ChangeOperation::Insert { .. } => None,
            ChangeOperation::Delete { node_id }
            | ChangeOperation::Move { node_id, .. }
            | ChangeOperation::Update { node_id, .. } => {
                locked(node_id).then(|| node_id.clone())
            }
            ChangeOperation::Reorder { day, node_ids } => {
                let number = day.or(self.scope.day())?;
                let current = self.days.iter().find(|d| d.number == number)?;
                current
                    .nodes
                    .iter()
                    .enumerate()
                    .find(|(pos, node)| {
                        node.locked && node_ids.get(*pos).map(|id| id != &node.id).unwrap_or(true)
                    })
                    .map(|(_, node)| node.id.clone())
            }
            ChangeOperation::Connect { edge, .. } => [&edge.from, &edge.to]
                .into_iter()
                .find(|id| locked(id))
                .cloned(),
            ChangeOperation::Disconnect { from, to, .. } => {
                [from, to].into_iter().find(|id| locked(id)).cloned()
            }
        }
    }

    fn apply(&mut self, op: &ChangeOperation) -> Result<Vec<ChangeDetail>, String> {
        match op {
            ChangeOperation::Insert { day, after, node } => self.insert(*day, after.as_deref(), node),
            ChangeOperation::Delete { node_id } => self.delete(node_id),
            ChangeOperation::Move {
                node_id,
                start,
                end,
            } => self.move_node(node_id, *start, *end),
            ChangeOperation::Reorder { day, node_ids } => self.reorder(*day, node_ids),
            ChangeOperation::Update { node_id, patch } => self.update(node_id, patch),
            ChangeOperation::Connect { day, edge } => self.connect(*day, edge),
            ChangeOperation::Disconnect { day, from, to } => self.disconnect(*day, from, to),
        }
    }

    fn insert(&mut self, day: Option<u32>, after: Option<&str>, node: &Node) -> Result<Vec<ChangeDetail>, String> {
        if node.id.trim().is_empty() {
            return Err("inserted node needs an id".into());
        }
        if self.locate(&node.id).is_some() {
            return Err(format!("node {} already exists", node.id));
        }
        let number = self.target_day(day, after)?;
        let di = self.day_index(number)?;
        let pos = match after {
            Some(anchor) => {
                self.days[di]
                    .position(anchor)
                    .ok_or_else(|| format!("anchor {anchor} not found on day {number}"))?
                    + 1
            }
            None => 0,
        };
        self.days[di].nodes.insert(pos, node.clone());

        Ok(vec![ChangeDetail {
            op: OperationKind::Insert,
            element: ElementType::Node,
            element_id: node.id.clone(),
            day: number,
            field_path: None,
            old_value: None,
            new_value: to_value(node),
            anchor: after.map(str::to_string),
        }])
    }

    fn delete(&mut self, node_id: &str) -> Result<Vec<ChangeDetail>, String> {
        let (di, pos) = self.find_node(node_id)?;
        let day = &mut self.days[di];
        let number = day.number;
        let anchor = pos.checked_sub(1).map(|p| day.nodes[p].id.clone());
        let node = day.nodes.remove(pos);

        let (dropped, kept): (Vec<Edge>, Vec<Edge>) =
            day.edges.drain(..).partition(|e| e.touches(node_id));
        day.edges = kept;

        // Edge removals come first so an inverse replay re-inserts the node before its edges.
        let mut details: Vec<ChangeDetail> = dropped
            .iter()
            .map(|edge| ChangeDetail {
                op: OperationKind::Delete,
                element: ElementType::Edge,
                element_id: edge_key(edge),
                day: number,
                field_path: None,
                old_value: to_value(edge),
                new_value: None,
                anchor: None,
            })
            .collect();
        details.push(ChangeDetail {
            op: OperationKind::Delete,
            element: ElementType::Node,
            element_id: node.id.clone(),
            day: number,
            field_path: None,
            old_value: to_value(&node),
            new_value: None,
            anchor,
        });
        Ok(details)
    }

    fn move_node(
        &mut self,
        node_id: &str,
        start: Option<chrono::NaiveTime>,
        end: Option<chrono::NaiveTime>,
    ) -> Result<Vec<ChangeDetail>, String> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(format!("node {node_id} would start after it ends"));
            }
        }
        let (di, pos) = self.find_node(node_id)?;
        let number = self.days[di].number;
        let node = &mut self.days[di].nodes[pos];
        let old = json!({ "start": node.start, "end": node.end });
        node.start = start;
        node.end = end;

        Ok(vec![ChangeDetail {
            op: OperationKind::Move,
            element: ElementType::Node,
            element_id: node_id.to_string(),
            day: number,
            field_path: Some("timing".into()),
            old_value: Some(old),
            new_value: Some(json!({ "start": start, "end": end })),
            anchor: None,
        }])
    }

    fn reorder(&mut self, day: Option<u32>, node_ids: &[NodeId]) -> Result<Vec<ChangeDetail>, String> {
        let number = self.target_day(day, None)?;
        let di = self.day_index(number)?;
        let current = &mut self.days[di];

        let existing: HashSet<&str> = current.nodes.iter().map(|n| n.id.as_str()).collect();
        let requested: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
        if node_ids.len() != current.nodes.len()
            || requested.len() != node_ids.len()
            || requested != existing
        {
            return Err(format!(
                "reorder of day {number} must list each of its nodes exactly once"
            ));
        }

        let old_order = current.node_ids();
        let mut by_id: HashMap<NodeId, Node> = current
            .nodes
            .drain(..)
            .map(|n| (n.id.clone(), n))
            .collect();
        for id in node_ids {
            if let Some(node) = by_id.remove(id) {
                current.nodes.push(node);
            }
        }

        Ok(vec![ChangeDetail {
            op: OperationKind::Reorder,
            element: ElementType::Day,
            element_id: number.to_string(),
            day: number,
            field_path: Some("nodes".into()),
            old_value: to_value(&old_order),
            new_value: to_value(&node_ids),
            anchor: None,
        }])
    }

    fn update(&mut self, node_id: &str, patch: &NodePatch) -> Result<Vec<ChangeDetail>, String> {
        if patch.is_empty() {
            return Err(format!("update of node {node_id} changes nothing"));
        }
        let (di, pos) = self.find_node(node_id)?;
        let number = self.days[di].number;
        let node = &mut self.days[di].nodes[pos];

        let mut fields: Vec<(&str, Option<Value>, Option<Value>)> = Vec::new();
        if let Some(title) = &patch.title {
            fields.push(("title", to_value(&node.title), to_value(title)));
            node.title = title.clone();
        }
        if let Some(kind) = patch.kind {
            fields.push(("kind", to_value(&node.kind), to_value(&kind)));
            node.kind = kind;
        }
        if let Some(place_id) = &patch.place_id {
            fields.push(("place_id", to_value(&node.place_id), to_value(place_id)));
            node.place_id = place_id.clone();
        }
        if let Some(notes) = &patch.notes {
            fields.push(("notes", to_value(&node.notes), to_value(notes)));
            node.notes = notes.clone();
        }
        if let Some(locked) = patch.locked {
            fields.push(("locked", to_value(&node.locked), to_value(&locked)));
            node.locked = locked;
        }

        Ok(fields
            .into_iter()
            .map(|(field, old_value, new_value)| ChangeDetail {
                op: OperationKind::Update,
                element: ElementType::Node,
                element_id: node_id.to_string(),
                day: number,
                field_path: Some(field.to_string()),
                old_value,
                new_value,
                anchor: None,
            })
            .collect())
    }

    fn connect(&mut self, day: Option<u32>, edge: &Edge) -> Result<Vec<ChangeDetail>, String> {
        let number = self.target_day(day, Some(&edge.from))?;
        let di = self.day_index(number)?;
        let current = &mut self.days[di];
        if current
            .edges
            .iter()
            .any(|e| e.from == edge.from && e.to == edge.to)
        {
            return Err(format!("edge {} already exists", edge_key(edge)));
        }
        current.edges.push(edge.clone());

        Ok(vec![ChangeDetail {
            op: OperationKind::Connect,
            element: ElementType::Edge,
            element_id: edge_key(edge),
            day: number,
            field_path: None,
            old_value: None,
            new_value: to_value(edge),
            anchor: None,
        }])
    }

    fn disconnect(&mut self, day: Option<u32>, from: &str, to: &str) -> Result<Vec<ChangeDetail>, String> {
        let number = self.target_day(day, Some(from))?;
        let di = self.day_index(number)?;
        let current = &mut self.days[di];
        let pos = current
            .edges
            .iter()
            .position(|e| e.from == from && e.to == to)
            .ok_or_else(|| format!("edge {from}->{to} not found on day {number}"))?;
        let edge = current.edges.remove(pos);

        Ok(vec![ChangeDetail {
            op: OperationKind::Disconnect,
            element: ElementType::Edge,
            element_id: edge_key(&edge),
            day: number,
            field_path: None,
            old_value: to_value(&edge),
            new_value: None,
            anchor: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Utc};
    use waypoint_schema::{Actor, AgentKind, ItinerarySettings, NodeKind, TravelMode};

    fn node(id: &str) -> Node {
        Node::new(id, NodeKind::Attraction, format!("Stop {id}"))
    }

    fn doc(ids: &[&str]) -> Itinerary {
        let mut day = Day::new(1);
        day.nodes = ids.iter().map(|id| node(id)).collect();
        let now = Utc::now();
        Itinerary {
            id: "trip-1".into(),
            version: 3,
            title: "Lisbon".into(),
            days: vec![day, Day::new(2)],
            settings: ItinerarySettings::default(),
            revisions: vec![],
            chat: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    fn ids(applied: &AppliedChanges, day: usize) -> Vec<String> {
        applied.days[day].node_ids()
    }

    fn user_set(ops: Vec<ChangeOperation>) -> ChangeSet {
        ChangeSet {
            operations: ops,
            ..ChangeSet::new(ChangeScope::Trip, Actor::user("u1"))
        }
    }

    fn agent_set(ops: Vec<ChangeOperation>) -> ChangeSet {
        ChangeSet {
            operations: ops,
            ..ChangeSet::new(ChangeScope::Trip, Actor::agent(AgentKind::Editor))
        }
    }

    #[test]
    fn insert_after_anchor_and_at_head() {
        let d = doc(&["A", "B"]);
        let set = user_set(vec![
            ChangeOperation::Insert {
                day: Some(1),
                after: Some("A".into()),
                node: node("X"),
            },
            ChangeOperation::Insert {
                day: Some(1),
                after: None,
                node: node("H"),
            },
        ]);
        let applied = apply_change_set(&d, &set, LockPolicy::default()).unwrap();
        assert_eq!(ids(&applied, 0), vec!["H", "A", "X", "B"]);
        assert_eq!(applied.changes.len(), 2);
        assert_eq!(applied.changes[0].anchor.as_deref(), Some("A"));
    }

    #[test]
    fn insert_infers_day_from_anchor() {
        let d = doc(&["A"]);
        let set = user_set(vec![ChangeOperation::Insert {
            day: None,
            after: Some("A".into()),
            node: node("B"),
        }]);
        let applied = apply_change_set(&d, &set, LockPolicy::default()).unwrap();
        assert_eq!(ids(&applied, 0), vec!["A", "B"]);
    }

    #[test]
    fn delete_removes_touching_edges() {
        let mut d = doc(&["A", "B", "C"]);
        d.days[0].edges = vec![
            Edge {
                from: "A".into(),
                to: "B".into(),
                mode: TravelMode::Walk,
                duration_minutes: Some(10),
            },
            Edge {
                from: "A".into(),
                to: "C".into(),
                mode: TravelMode::Drive,
                duration_minutes: None,
            },
        ];
        let set = user_set(vec![ChangeOperation::Delete {
            node_id: "B".into(),
        }]);
        let applied = apply_change_set(&d, &set, LockPolicy::default()).unwrap();
        assert_eq!(ids(&applied, 0), vec!["A", "C"]);
        assert_eq!(applied.days[0].edges.len(), 1);
        assert_eq!(applied.changes.len(), 2);
        assert_eq!(applied.changes[0].element, ElementType::Edge);
        assert_eq!(applied.changes[1].anchor.as_deref(), Some("A"));
    }

    #[test]
    fn move_rewrites_timing_only() {
        let d = doc(&["A", "B"]);
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let set = user_set(vec![ChangeOperation::Move {
            node_id: "B".into(),
            start: Some(nine),
            end: Some(ten),
        }]);
        let applied = apply_change_set(&d, &set, LockPolicy::default()).unwrap();
        assert_eq!(ids(&applied, 0), vec!["A", "B"]);
        assert_eq!(applied.days[0].nodes[1].start, Some(nine));

        let backwards = user_set(vec![ChangeOperation::Move {
            node_id: "B".into(),
            start: Some(ten),
            end: Some(nine),
        }]);
        assert!(matches!(
            apply_change_set(&d, &backwards, LockPolicy::default()),
            Err(ApplyFailure::Invalid { index: Some(0), .. })
        ));
    }

    #[test]
    fn reorder_requires_permutation() {
        let d = doc(&["A", "B", "C"]);
        let good = user_set(vec![ChangeOperation::Reorder {
            day: Some(1),
            node_ids: vec!["C".into(), "A".into(), "B".into()],
        }]);
        let applied = apply_change_set(&d, &good, LockPolicy::default()).unwrap();
        assert_eq!(ids(&applied, 0), vec!["C", "A", "B"]);

        let missing = user_set(vec![ChangeOperation::Reorder {
            day: Some(1),
            node_ids: vec!["C".into(), "A".into()],
        }]);
        assert!(apply_change_set(&d, &missing, LockPolicy::default()).is_err());

        let duplicated = user_set(vec![ChangeOperation::Reorder {
            day: Some(1),
            node_ids: vec!["A".into(), "A".into(), "B".into()],
        }]);
        assert!(apply_change_set(&d, &duplicated, LockPolicy::default()).is_err());
    }

    #[test]
    fn later_failure_rejects_whole_batch() {
        let d = doc(&["A", "B"]);
        let set = user_set(vec![
            ChangeOperation::Delete {
                node_id: "A".into(),
            },
            ChangeOperation::Delete {
                node_id: "missing".into(),
            },
        ]);
        match apply_change_set(&d, &set, LockPolicy::default()) {
            Err(ApplyFailure::Invalid { index, reason }) => {
                assert_eq!(index, Some(1));
                assert!(reason.contains("missing"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn day_scope_confines_operations() {
        let mut d = doc(&["A"]);
        d.days[1].nodes.push(node("Z"));
        let set = ChangeSet {
            operations: vec![ChangeOperation::Delete {
                node_id: "Z".into(),
            }],
            ..ChangeSet::new(ChangeScope::Day { day: 1 }, Actor::user("u1"))
        };
        assert!(matches!(
            apply_change_set(&d, &set, LockPolicy::default()),
            Err(ApplyFailure::Invalid { .. })
        ));
    }

    #[test]
    fn agent_edit_on_locked_node_is_rejected_per_operation() {
        let mut d = doc(&["A", "B", "C"]);
        d.days[0].nodes[1].locked = true;
        let set = agent_set(vec![
            ChangeOperation::Delete {
                node_id: "B".into(),
            },
            ChangeOperation::Delete {
                node_id: "C".into(),
            },
        ]);
        let applied = apply_change_set(&d, &set, LockPolicy::RejectOperation).unwrap();
        assert_eq!(ids(&applied, 0), vec!["A", "B"]);
        assert_eq!(applied.rejected.len(), 1);
        assert_eq!(applied.rejected[0].node_id, "B");
        assert_eq!(applied.rejected[0].index, 0);

        assert!(matches!(
            apply_change_set(&d, &set, LockPolicy::RejectChangeSet),
            Err(ApplyFailure::Locked(rejected)) if rejected.len() == 1
        ));
    }

    #[test]
    fn all_operations_locked_is_a_rejection() {
        let mut d = doc(&["A", "B"]);
        d.days[0].nodes[0].locked = true;
        let set = agent_set(vec![ChangeOperation::Update {
            node_id: "A".into(),
            patch: NodePatch {
                title: Some("renamed".into()),
                ..NodePatch::default()
            },
        }]);
        assert!(matches!(
            apply_change_set(&d, &set, LockPolicy::RejectOperation),
            Err(ApplyFailure::Locked(_))
        ));
    }

    #[test]
    fn users_may_edit_locked_nodes() {
        let mut d = doc(&["A", "B"]);
        d.days[0].nodes[0].locked = true;
        let set = user_set(vec![ChangeOperation::Delete {
            node_id: "A".into(),
        }]);
        let applied = apply_change_set(&d, &set, LockPolicy::RejectChangeSet).unwrap();
        assert_eq!(ids(&applied, 0), vec!["B"]);
    }

    #[test]
    fn reorder_around_locked_node_keeps_its_slot() {
        let mut d = doc(&["A", "B", "C"]);
        d.days[0].nodes[1].locked = true;
        let swap_ends = agent_set(vec![ChangeOperation::Reorder {
            day: Some(1),
            node_ids: vec!["C".into(), "B".into(), "A".into()],
        }]);
        assert!(apply_change_set(&d, &swap_ends, LockPolicy::default()).is_ok());

        let displaces = agent_set(vec![ChangeOperation::Reorder {
            day: Some(1),
            node_ids: vec!["B".into(), "A".into(), "C".into()],
        }]);
        assert!(matches!(
            apply_change_set(&d, &displaces, LockPolicy::default()),
            Err(ApplyFailure::Locked(_))
        ));
    }

    #[test]
    fn connect_to_unknown_node_fails_validation() {
        let d = doc(&["A"]);
        let set = user_set(vec![ChangeOperation::Connect {
            day: Some(1),
            edge: Edge {
                from: "A".into(),
                to: "ghost".into(),
                mode: TravelMode::Walk,
                duration_minutes: None,
            },
        }]);
        assert!(matches!(
            apply_change_set(&d, &set, LockPolicy::default()),
            Err(ApplyFailure::Invalid { index: None, .. })
        ));
    }

    #[test]
    fn update_records_each_field() {
        let d = doc(&["A"]);
        let set = user_set(vec![ChangeOperation::Update {
            node_id: "A".into(),
            patch: NodePatch {
                title: Some("Belém Tower".into()),
                place_id: Some(Some("place_abc".into())),
                ..NodePatch::default()
            },
        }]);
        let applied = apply_change_set(&d, &set, LockPolicy::default()).unwrap();
        let fields: Vec<_> = applied
            .changes
            .iter()
            .filter_map(|c| c.field_path.as_deref())
            .collect();
        assert_eq!(fields, vec!["title", "place_id"]);
        assert_eq!(
            applied.days[0].nodes[0].place_id.as_deref(),
            Some("place_abc")
        );
    }

    #[test]
    fn empty_change_set_is_invalid() {
        let d = doc(&["A"]);
        assert!(matches!(
            apply_change_set(&d, &user_set(vec![]), LockPolicy::default()),
            Err(ApplyFailure::Invalid { index: None, .. })
        ));
    }
}
