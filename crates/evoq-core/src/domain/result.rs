//! Result model: what a worker publishes for each completed attempt.
//!
//! A result is keyed by `task_id`; a newer result for the same id replaces the
//! older one. Nothing in this crate ever deletes a result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Payload, Task, TaskId, TaskKind};

/// `data` key a handler sets to `true` to ask for another attempt on error.
pub const RETRYABLE_KEY: &str = "retryable";

/// `data` key holding the error message of an `error` result.
pub const ERROR_KEY: &str = "error";

/// `data` key holding the reason of a `skip` result.
pub const REASON_KEY: &str = "reason";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,

    /// Kind of the task this answers; optional on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,

    pub status: ResultStatus,

    #[serde(default)]
    pub data: Payload,

    pub created_at: DateTime<Utc>,

    /// Attempt number that produced this result (first run is 1).
    #[serde(default)]
    pub attempts_used: u32,
}

impl TaskResult {
    fn for_task(task: &Task, status: ResultStatus, data: Payload) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: Some(task.kind),
            status,
            data,
            created_at: Utc::now(),
            attempts_used: task.attempts().saturating_add(1),
        }
    }

    pub fn ok(task: &Task, data: Payload) -> Self {
        Self::for_task(task, ResultStatus::Ok, data)
    }

    pub fn error(task: &Task, message: impl Into<String>, retryable: bool) -> Self {
        let mut data = Payload::new();
        data.insert(ERROR_KEY.to_string(), Value::String(message.into()));
        data.insert(RETRYABLE_KEY.to_string(), Value::Bool(retryable));
        Self::for_task(task, ResultStatus::Error, data)
    }

    pub fn skip(task: &Task, reason: impl Into<String>) -> Self {
        let mut data = Payload::new();
        data.insert(REASON_KEY.to_string(), Value::String(reason.into()));
        Self::for_task(task, ResultStatus::Skip, data)
    }

    /// Terminal error for a task that could not be decoded, so only its id is
    /// known.
    pub fn refused(task_id: TaskId, message: impl Into<String>) -> Self {
        let mut data = Payload::new();
        data.insert(ERROR_KEY.to_string(), Value::String(message.into()));
        data.insert(RETRYABLE_KEY.to_string(), Value::Bool(false));
        Self {
            task_id,
            kind: None,
            status: ResultStatus::Error,
            data,
            created_at: Utc::now(),
            attempts_used: 0,
        }
    }

    /// Override the creation timestamp (workers stamp results with their clock).
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Only `data.retryable == true` counts; anything else is terminal.
    pub fn is_retryable(&self) -> bool {
        self.data
            .get(RETRYABLE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.get(ERROR_KEY).and_then(Value::as_str)
    }
}
