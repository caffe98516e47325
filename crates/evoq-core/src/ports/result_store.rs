//! ResultStore port - results keyed by task id.
//!
//! # Contract
//! - `save` is an overwrite-by-id upsert and is atomic: a reader sees the old
//!   record or the new one, never half of either.
//! - A failed `save` is reported. A missing result would otherwise look the
//!   same as a task that is still running.
//! - `iterate` is finite and restartable; every call starts from what is
//!   committed at that moment.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::domain::{ErrorKind, TaskId, TaskKind, TaskResult};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored result is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("result backend unreachable: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Corrupt(_) => ErrorKind::Permanent,
            StoreError::Io(_) | StoreError::Backend(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Lazily fetched sequence of stored results. Each item is read from the
/// backend when the stream is polled for it.
pub type ResultStream = BoxStream<'static, Result<TaskResult, StoreError>>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, result: &TaskResult) -> Result<(), StoreError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskResult>, StoreError>;

    /// All results, optionally only those answering tasks of `kind`.
    async fn iterate(&self, kind: Option<TaskKind>) -> Result<ResultStream, StoreError>;
}

/// Filter used by every store for the optional kind argument.
pub(crate) fn kind_matches(result: &TaskResult, kind: Option<TaskKind>) -> bool {
    match kind {
        None => true,
        Some(kind) => result.kind == Some(kind),
    }
}
