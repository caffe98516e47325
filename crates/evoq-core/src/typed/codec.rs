//! Wire codec for tasks and results.
//!
//! The encoding is a compact JSON map with stable field names. Readers ignore
//! fields they do not know, so producers can add optional fields freely. A task
//! whose `schema_version` is above [`SCHEMA_VERSION`] is refused outright:
//! guessing at the meaning of a newer layout is worse than failing it.

use serde_json::Value;
use thiserror::Error;

use crate::domain::{ErrorKind, SCHEMA_VERSION, Task, TaskId, TaskResult};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed wire document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("schema_version {found} is newer than supported {supported}")]
    UnsupportedSchema {
        /// Present whenever the document still has a readable `id`.
        task_id: Option<TaskId>,
        found: u64,
        supported: u32,
    },
}

impl WireError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }

    /// Task id recoverable from the rejected document, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            WireError::UnsupportedSchema { task_id, .. } => task_id.as_ref(),
            WireError::Malformed(_) => None,
        }
    }
}

pub fn encode_task(task: &Task) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(task)?)
}

pub fn decode_task(bytes: &[u8]) -> Result<Task, WireError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let found = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(u64::from(SCHEMA_VERSION));
    if found > u64::from(SCHEMA_VERSION) {
        return Err(WireError::UnsupportedSchema {
            task_id: value.get("id").and_then(Value::as_str).map(TaskId::new),
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(serde_json::from_value(value)?)
}

/// Same check `decode_task` applies, for tasks that never went over the wire.
pub fn check_schema(task: &Task) -> Result<(), WireError> {
    if task.schema_version > SCHEMA_VERSION {
        return Err(WireError::UnsupportedSchema {
            task_id: Some(task.id.clone()),
            found: u64::from(task.schema_version),
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}

pub fn encode_result(result: &TaskResult) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(result)?)
}

pub fn decode_result(bytes: &[u8]) -> Result<TaskResult, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}
