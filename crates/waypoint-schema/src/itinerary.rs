use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Actor, RevisionRecord};

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Attraction,
    Meal,
    Lodging,
    Transit,
    Activity,
    FreeTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub title: String,
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default)]
    pub start: Option<NaiveTime>,
    #[serde(default)]
    pub end: Option<NaiveTime>,
    /// Locked nodes are off-limits to agent edits when the itinerary respects locks.
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            place_id: None,
            start: None,
            end: None,
            locked: false,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    Walk,
    Drive,
    Transit,
    Flight,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub mode: TravelMode,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

impl Edge {
    pub fn touches(&self, node_id: &str) -> bool {
        self.from == node_id || self.to == node_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Day {
    pub number: u32,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Day {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            date: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItinerarySettings {
    #[serde(default = "default_true")]
    pub respect_locks: bool,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Default for ItinerarySettings {
    fn default() -> Self {
        Self {
            respect_locks: true,
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub at: DateTime<Utc>,
    pub author: Actor,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: String,
    pub version: u64,
    pub title: String,
    #[serde(default)]
    pub days: Vec<Day>,
    #[serde(default)]
    pub settings: ItinerarySettings,
    #[serde(default)]
    pub revisions: Vec<RevisionRecord>,
    #[serde(default)]
    pub chat: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Itinerary {
    pub fn day(&self, number: u32) -> Option<&Day> {
        self.days.iter().find(|d| d.number == number)
    }

    /// Returns `(day number, position)` of a node.
    pub fn locate(&self, node_id: &str) -> Option<(u32, usize)> {
        self.days
            .iter()
            .find_map(|d| d.position(node_id).map(|pos| (d.number, pos)))
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.days
            .iter()
            .flat_map(|d| d.nodes.iter())
            .find(|n| n.id == node_id)
    }

    pub fn node_count(&self) -> usize {
        self.days.iter().map(|d| d.nodes.len()).sum()
    }
}

/// Input for creating a new itinerary document at version 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItineraryDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub days: Vec<Day>,
    #[serde(default)]
    pub settings: ItinerarySettings,
}
