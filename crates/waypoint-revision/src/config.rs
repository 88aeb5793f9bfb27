use serde::{Deserialize, Serialize};

/// How agent edits that hit locked nodes are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Skip the offending operations and report them; apply the rest.
    #[default]
    RejectOperation,
    /// Any locked hit rejects the whole change set.
    RejectChangeSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionConfig {
    #[serde(default)]
    pub lock_policy: LockPolicy,
}
