//! Domain identifiers (strongly-typed IDs).
//!
//! Task ids are opaque strings on the wire: producers may bring their own, and
//! ids minted here look like `task-01J...` (a ULID behind a prefix) so they
//! sort by creation time.
//!
//! `Id<T>` carries a phantom marker type so a `TaskId` can never be passed
//! where a `WorkerId` is expected, while both share one implementation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each id flavour.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used when minting a new id (e.g. `"task-"`).
    fn prefix() -> &'static str;
}

/// Generic string id tagged with a marker type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Wrap an existing id string as-is.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// Mint an id from a ULID, using the marker prefix.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self::new(format!("{}{}", T::prefix(), ulid))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Identifier of a Task. Unique for the lifetime of the system.
pub type TaskId = Id<Task>;

/// Identifier of a worker process; doubles as the broker consumer name.
pub type WorkerId = Id<Worker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_carry_their_prefix() {
        let task = TaskId::from_ulid(Ulid::new());
        let worker = WorkerId::from_ulid(Ulid::new());

        assert!(task.as_str().starts_with("task-"));
        assert!(worker.to_string().starts_with("worker-"));
        // let _: TaskId = worker; // <- does not compile
    }

    #[test]
    fn foreign_ids_are_kept_verbatim() {
        let id = TaskId::from("gen-42/mutate-7");
        assert_eq!(id.as_str(), "gen-42/mutate-7");
    }

    #[test]
    fn ulid_ids_sort_by_creation() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = TaskId::new("task-abc");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"task-abc\"");

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }
}
