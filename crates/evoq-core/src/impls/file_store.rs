//! FileResultStore - one JSON document per task id under a root directory.
//!
//! Writes go to a temp file in the same directory, are fsynced, then renamed
//! over the final name, so a reader either sees the previous document or the
//! new one. Filesystem work runs on the blocking pool.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{StreamExt, stream};

use crate::domain::{TaskId, TaskKind, TaskResult};
use crate::ports::result_store::kind_matches;
use crate::ports::{ResultStore, ResultStream, StoreError};

const EXTENSION: &str = "json";

pub struct FileResultStore {
    root: PathBuf,
}

impl FileResultStore {
    /// Creates `root` if it does not exist yet.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.root
            .join(format!("{}.{EXTENSION}", file_stem(task_id.as_str())))
    }
}

/// Task ids are opaque, so anything outside `[A-Za-z0-9_-]` is %-escaped.
fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => stem.push(byte as char),
            other => stem.push_str(&format!("%{other:02X}")),
        }
    }
    stem
}

fn write_atomic(root: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".result-")
        .suffix(".tmp")
        .tempfile_in(root)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target)?;
    Ok(())
}

fn read_result(path: &Path) -> Result<Option<TaskResult>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn is_result_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'));
    visible && path.extension().is_some_and(|ext| ext == EXTENSION)
}

fn blocking_error(err: tokio::task::JoinError) -> StoreError {
    StoreError::Io(io::Error::other(err))
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn save(&self, result: &TaskResult) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(result)?;
        let root = self.root.clone();
        let target = self.path_for(&result.task_id);

        tokio::task::spawn_blocking(move || write_atomic(&root, &target, &bytes))
            .await
            .map_err(blocking_error)??;
        tracing::debug!(task_id = %result.task_id, "result saved");
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskResult>, StoreError> {
        let path = self.path_for(task_id);
        tokio::task::spawn_blocking(move || read_result(&path))
            .await
            .map_err(blocking_error)?
    }

    /// Lists the directory up front; each document is read when the stream
    /// reaches it. Files removed in between are skipped.
    async fn iterate(&self, kind: Option<TaskKind>) -> Result<ResultStream, StoreError> {
        let root = self.root.clone();
        let mut paths = tokio::task::spawn_blocking(move || -> io::Result<Vec<PathBuf>> {
            let mut paths = Vec::new();
            for entry in fs::read_dir(&root)? {
                let path = entry?.path();
                if is_result_file(&path) {
                    paths.push(path);
                }
            }
            Ok(paths)
        })
        .await
        .map_err(blocking_error)??;
        paths.sort();

        let results = stream::iter(paths).filter_map(move |path| async move {
            let read = tokio::task::spawn_blocking(move || read_result(&path))
                .await
                .map_err(blocking_error);
            match read {
                Ok(Ok(Some(result))) => kind_matches(&result, kind).then_some(Ok(result)),
                Ok(Ok(None)) => None,
                Ok(Err(err)) | Err(err) => Some(Err(err)),
            }
        });
        Ok(Box::pin(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ResultStatus, Task};
    use futures::TryStreamExt;
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;

    fn task(id: &str, kind: TaskKind) -> Task {
        Task::new(TaskId::new(id), kind, Utc::now())
    }

    #[rstest]
    #[case::plain("task-01HX", "task-01HX")]
    #[case::slash("a/b", "a%2Fb")]
    #[case::dot("..", "%2E%2E")]
    fn stems_are_filesystem_safe(#[case] id: &str, #[case] stem: &str) {
        assert_eq!(file_stem(id), stem);
    }

    #[tokio::test]
    async fn save_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).unwrap();
        let t = task("t-1", TaskKind::Execute);

        assert!(store.get(&t.id).await.unwrap().is_none());

        let result = TaskResult::ok(&t, Default::default()).with_data("fitness", json!(0.5));
        store.save(&result).await.unwrap();

        let loaded = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded, result);
    }

    #[tokio::test]
    async fn overwrite_leaves_one_document_and_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).unwrap();
        let t = task("t-1", TaskKind::Evaluate);

        for score in [1, 2, 3] {
            let result = TaskResult::ok(&t, Default::default()).with_data("score", json!(score));
            store.save(&result).await.unwrap();
        }

        let all: Vec<TaskResult> = store
            .iterate(None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].data["score"], json!(3));

        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn iterate_filters_by_kind_and_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).unwrap();
        store
            .save(&TaskResult::ok(&task("t-a", TaskKind::Render), Default::default()))
            .await
            .unwrap();
        store
            .save(&TaskResult::skip(&task("t-b", TaskKind::Evaluate), "no gpu"))
            .await
            .unwrap();

        let evals: Vec<TaskResult> = store
            .iterate(Some(TaskKind::Evaluate))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].status, ResultStatus::Skip);

        assert_eq!(store.iterate(None).await.unwrap().count().await, 2);
        assert_eq!(store.iterate(None).await.unwrap().count().await, 2);
    }

    #[tokio::test]
    async fn corrupt_document_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("t-bad.json"), b"{not json").unwrap();

        let err = store.get(&TaskId::new("t-bad")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));

        let items: Vec<_> = store.iterate(None).await.unwrap().collect().await;
        assert!(items[0].is_err());
    }
}
