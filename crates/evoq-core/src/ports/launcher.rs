//! WorkerLauncher port - how the warm-spawner starts one-shot workers.
//!
//! Launchers only start workers and count the live ones. Stopping is the
//! worker's own job (idle timer, max uptime), so there is no kill method.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ErrorKind, WorkerId};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("launch quota exhausted: {0}")]
    Quota(String),
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::Spawn(_) => ErrorKind::Infrastructure,
            LaunchError::Quota(_) => ErrorKind::Transient,
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Workers started by this launcher that have not exited yet.
    async fn live_workers(&self) -> usize;

    async fn launch(&self) -> Result<WorkerId, LaunchError>;
}
