//! TaskQueue port - the seam between producers, workers and the broker.
//!
//! # Delivery model
//! - Tasks are delivered at least once: a claim that is never acked is
//!   eventually reclaimed by `requeue_orphans` and handed out again.
//! - Results are idempotent overwrites keyed by task id.
//! - Pop order is best-effort. Nothing may rely on FIFO.
//!
//! # Blocking
//! Only `pop` and `wait_for_result` wait, and both are bounded by the caller's
//! timeout. Everything else returns promptly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ErrorKind, Task, TaskId, TaskResult};
use crate::ports::StoreError;
use crate::typed::WireError;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached. Producers fail fast on this.
    #[error("broker unreachable: {0}")]
    Transport(String),

    #[error("unexpected broker reply: {0}")]
    Protocol(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("failed to persist result: {0}")]
    ResultPersist(#[from] StoreError),

    #[error("task {0} is already known to this queue")]
    DuplicateTask(TaskId),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Transport(_) | QueueError::ResultPersist(_) => ErrorKind::Infrastructure,
            QueueError::Protocol(_) => ErrorKind::Transient,
            QueueError::Wire(_) | QueueError::DuplicateTask(_) => ErrorKind::Permanent,
        }
    }
}

/// Point-in-time depth of one logical queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub dead: usize,

    /// Age of the oldest pending task, when the backend can tell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_pending_secs: Option<u64>,
}

/// A task parked after exhausting its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: String,
    pub moved_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append to the pending set. Never drops silently.
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Claim one pending task. `Ok(None)` means nothing arrived in time.
    ///
    /// With `block == false` the call returns immediately when nothing is
    /// pending and `timeout` is ignored.
    async fn pop(&self, block: bool, timeout: Duration) -> Result<Option<Task>, QueueError>;

    /// Retire a claim. Unknown or already-acked ids are a no-op.
    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError>;

    /// Hand a claim back to pending untouched (no attempts increment).
    /// Unknown ids are a no-op.
    async fn release(&self, task_id: &TaskId) -> Result<(), QueueError>;

    async fn push_result(&self, result: TaskResult) -> Result<(), QueueError>;

    async fn wait_for_result(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, QueueError>;

    /// Move up to `max_batch` claims older than `idle_threshold` back to
    /// pending with `attempts + 1`, returning how many were moved.
    ///
    /// Claims whose next attempt would exceed the retry budget go to the
    /// dead-letter channel instead and are not counted.
    async fn requeue_orphans(
        &self,
        idle_threshold: Duration,
        max_batch: usize,
    ) -> Result<usize, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Newest first, at most `limit` entries.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    /// Put a dead-lettered task back in pending with a fresh budget.
    /// Returns `false` when no such entry exists.
    async fn replay_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    /// Drop a dead-lettered task. Returns `false` when no such entry exists.
    async fn discard_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    /// Forget broker-side registrations of workers that hold no claims and
    /// have been idle for at least `idle`. Returns how many were dropped.
    ///
    /// Backends that keep no per-worker state have nothing to prune.
    async fn prune_idle_consumers(&self, _idle: Duration) -> Result<usize, QueueError> {
        Ok(0)
    }
}
