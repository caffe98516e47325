//! InProcessLauncher - runs one-shot workers as tokio tasks.
//!
//! Used by tests and offline runs with a `LocalQueue`, where worker processes
//! would not share the queue anyway.
//! - `request_shutdown()` asks every worker to stop after its current task.
//! - `shutdown_and_join()` also waits for them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::app::WorkerTemplate;
use crate::domain::WorkerId;
use crate::ports::{IdGenerator, LaunchError, TaskQueue, WorkerLauncher};

pub struct InProcessLauncher {
    template: WorkerTemplate,
    queue: Arc<dyn TaskQueue>,
    ids: Arc<dyn IdGenerator>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl InProcessLauncher {
    pub fn new(
        template: WorkerTemplate,
        queue: Arc<dyn TaskQueue>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            template,
            queue,
            ids,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn request_shutdown(&self) {
        // send_replace never fails, even with no workers subscribed.
        self.shutdown_tx.send_replace(true);
    }

    pub async fn shutdown_and_join(&self) {
        self.request_shutdown();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn live_workers(&self) -> usize {
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    async fn launch(&self) -> Result<WorkerId, LaunchError> {
        if *self.shutdown_tx.borrow() {
            return Err(LaunchError::Quota("launcher is shutting down".into()));
        }
        let id = self.ids.generate_worker_id();
        let worker = self
            .template
            .worker(Arc::clone(&self.queue), id.clone())
            .with_shutdown(self.shutdown_tx.subscribe());

        let handle = tokio::spawn(async move {
            let worker_id = worker.id().clone();
            match worker.run().await {
                Ok(exit) => {
                    tracing::debug!(worker_id = %worker_id, reason = ?exit.reason, completed = exit.completed, "worker done")
                }
                Err(err) => {
                    tracing::warn!(worker_id = %worker_id, error = %err, exit_code = err.exit_code(), "worker failed")
                }
            }
        });
        self.handles.lock().await.push(handle);
        Ok(id)
    }
}
