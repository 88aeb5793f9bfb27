use std::collections::{HashMap, HashSet};

use waypoint_schema::{Day, EdgeRef, ItineraryDiff, Node, NodeRef, NodeUpdate};

/// Partition nodes into added, removed and updated between two versions.
///
/// Position is not node content: a relative-order change among surviving
/// nodes is reported through `reordered_days` instead.
pub fn diff_days(before: &[Day], after: &[Day]) -> ItineraryDiff {
    let old_nodes = index_nodes(before);
    let new_nodes = index_nodes(after);
    let mut diff = ItineraryDiff::default();

    for day in before {
        for node in &day.nodes {
            if !new_nodes.contains_key(node.id.as_str()) {
                diff.removed.push(NodeRef {
                    day: day.number,
                    node_id: node.id.clone(),
                });
            }
        }
    }

    for day in after {
        for node in &day.nodes {
            match old_nodes.get(node.id.as_str()) {
                None => diff.added.push(NodeRef {
                    day: day.number,
                    node_id: node.id.clone(),
                }),
                Some((old_day, old)) => {
                    let mut fields = changed_fields(old, node);
                    if *old_day != day.number {
                        fields.insert(0, "day".to_string());
                    }
                    if !fields.is_empty() {
                        diff.updated.push(NodeUpdate {
                            day: day.number,
                            node_id: node.id.clone(),
                            fields,
                        });
                    }
                }
            }
        }

        if let Some(old_day) = before.iter().find(|d| d.number == day.number) {
            if relative_order_changed(old_day, day) {
                diff.reordered_days.push(day.number);
            }
        }
    }

    diff_edges(before, after, &mut diff);
    diff
}

fn index_nodes(days: &[Day]) -> HashMap<&str, (u32, &Node)> {
    days.iter()
        .flat_map(|d| d.nodes.iter().map(move |n| (n.id.as_str(), (d.number, n))))
        .collect()
}

fn changed_fields(old: &Node, new: &Node) -> Vec<String> {
    let mut fields = Vec::new();
    if old.title != new.title {
        fields.push("title");
    }
    if old.kind != new.kind {
        fields.push("kind");
    }
    if old.place_id != new.place_id {
        fields.push("place_id");
    }
    if old.start != new.start {
        fields.push("start");
    }
    if old.end != new.end {
        fields.push("end");
    }
    if old.locked != new.locked {
        fields.push("locked");
    }
    if old.notes != new.notes {
        fields.push("notes");
    }
    fields.into_iter().map(str::to_string).collect()
}

fn relative_order_changed(before: &Day, after: &Day) -> bool {
    let kept_before: Vec<&str> = {
        let present: HashSet<&str> = after.nodes.iter().map(|n| n.id.as_str()).collect();
        before
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| present.contains(id))
            .collect()
    };
    let present: HashSet<&str> = before.nodes.iter().map(|n| n.id.as_str()).collect();
    let kept_after = after
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| present.contains(id));
    !kept_before.iter().copied().eq(kept_after)
}

fn diff_edges(before: &[Day], after: &[Day], diff: &mut ItineraryDiff) {
    let key = |d: &Day, e: &waypoint_schema::Edge| EdgeRef {
        day: d.number,
        from: e.from.clone(),
        to: e.to.clone(),
    };
    let old: Vec<(EdgeRef, &waypoint_schema::Edge)> = before
        .iter()
        .flat_map(|d| d.edges.iter().map(move |e| (key(d, e), e)))
        .collect();
    let new: Vec<(EdgeRef, &waypoint_schema::Edge)> = after
        .iter()
        .flat_map(|d| d.edges.iter().map(move |e| (key(d, e), e)))
        .collect();

    // An edge whose mode or duration changed shows up as removed then added.
    for (r, edge) in &old {
        if !new.iter().any(|(nr, ne)| nr == r && ne == edge) {
            diff.edges_removed.push(r.clone());
        }
    }
    for (r, edge) in &new {
        if !old.iter().any(|(or, oe)| or == r && oe == edge) {
            diff.edges_added.push(r.clone());
        }
    }
}

/// Short human-readable description of a diff.
pub fn summarize(diff: &ItineraryDiff) -> String {
    let mut parts = Vec::new();
    let mut count = |n: usize, what: &str| {
        if n > 0 {
            parts.push(format!("{n} {what}"));
        }
    };
    count(diff.added.len(), "added");
    count(diff.removed.len(), "removed");
    count(diff.updated.len(), "updated");
    count(diff.reordered_days.len(), "day(s) reordered");
    count(
        diff.edges_added.len() + diff.edges_removed.len(),
        "connection(s) changed",
    );
    if parts.is_empty() {
        "no visible changes".to_string()
    } else {
        parts.join(", ")
    }
}
