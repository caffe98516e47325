use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CapabilitySet, TaskId};

/// Highest major schema version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

/// Opaque key/value map; interpreted by handlers only, never by a queue.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Kind of work carried by a task.
///
/// Append-only: new kinds get the next code, existing codes are never reused
/// or repurposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Render = 0,
    Mutate = 1,
    Execute = 2,
    Evaluate = 3,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Render,
        TaskKind::Mutate,
        TaskKind::Execute,
        TaskKind::Evaluate,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Render => "render",
            TaskKind::Mutate => "mutate",
            TaskKind::Execute => "execute",
            TaskKind::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task kind '{0}'")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}

/// A unit of work as it travels through queues and workers.
///
/// `attempts` is only ever raised by the reclaim path inside a queue, so it
/// has no public setter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub id: TaskId,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub requires: CapabilitySet,
    #[serde(default)]
    attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Task {
    pub fn new(id: TaskId, kind: TaskKind, created_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            id,
            payload: Payload::new(),
            requires: CapabilitySet::new(),
            attempts: 0,
            created_at,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_requires(mut self, requires: CapabilitySet) -> Self {
        self.requires = requires;
        self
    }

    /// How many times this task has been handed back by reclaim.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn bump_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(TaskKind::Render.code(), 0);
        assert_eq!(TaskKind::Mutate.code(), 1);
        assert_eq!(TaskKind::Execute.code(), 2);
        assert_eq!(TaskKind::Evaluate.code(), 3);
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Execute".parse::<TaskKind>().unwrap(), TaskKind::Execute);
        assert!("compile".parse::<TaskKind>().is_err());
    }

    #[test]
    fn kind_serializes_lowercase() {
        let s = serde_json::to_string(&TaskKind::Evaluate).unwrap();
        assert_eq!(s, "\"evaluate\"");
    }

    #[test]
    fn new_task_starts_with_zero_attempts() {
        let mut task = Task::new(TaskId::new("t-1"), TaskKind::Mutate, Utc::now());
        assert_eq!(task.attempts(), 0);
        assert_eq!(task.schema_version, SCHEMA_VERSION);

        task.bump_attempts();
        task.bump_attempts();
        assert_eq!(task.attempts(), 2);
    }
}
