//! Conflicts surfaced by sync steps.

use serde::{Deserialize, Serialize};

/// A local object that diverged from what the server reported.
///
/// Conflicts are produced by a step and consumed by the orchestrator in the
/// same pass; they are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conflict {
    /// Object key.
    pub key: String,
    /// Object type name (`collection`, `item`, `search`).
    pub object_type: String,
}

impl Conflict {
    /// Creates a new conflict.
    pub fn new(key: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            object_type: object_type.into(),
        }
    }
}
