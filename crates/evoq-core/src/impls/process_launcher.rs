//! ProcessLauncher - starts each worker as a child process.
//!
//! The child gets the configured arguments plus `--worker-id <id>`. Exited
//! children are reaped whenever the live count is read.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::domain::WorkerId;
use crate::ports::{IdGenerator, LaunchError, WorkerLauncher};

pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    ids: Arc<dyn IdGenerator>,
    children: Mutex<Vec<(WorkerId, Child)>>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            program: program.into(),
            args,
            ids,
            children: Mutex::new(Vec::new()),
        }
    }

    /// Relaunches the running executable, e.g. `evoq worker ...`.
    pub fn current_exe(args: Vec<String>, ids: Arc<dyn IdGenerator>) -> Result<Self, LaunchError> {
        Ok(Self::new(std::env::current_exe()?, args, ids))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn live_workers(&self) -> usize {
        let mut children = self.children.lock().await;
        children.retain_mut(|(id, child)| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if status.success() {
                    tracing::debug!(worker_id = %id, %status, "worker process exited");
                } else {
                    tracing::warn!(worker_id = %id, %status, "worker process failed");
                }
                false
            }
            Err(err) => {
                tracing::warn!(worker_id = %id, error = %err, "lost track of worker process");
                false
            }
        });
        children.len()
    }

    async fn launch(&self) -> Result<WorkerId, LaunchError> {
        let id = self.ids.generate_worker_id();
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--worker-id")
            .arg(id.as_str())
            .stdin(Stdio::null())
            .spawn()?;
        tracing::debug!(worker_id = %id, pid = child.id(), "spawned worker process");
        self.children.lock().await.push((id.clone(), child));
        Ok(id)
    }
}
