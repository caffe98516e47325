//! ExecutionSandbox port - the opaque collaborator that runs candidate code.
//!
//! The sandbox takes source plus an entry point and returns metrics. How it
//! isolates the program (container, VM, subprocess) is its own business.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Payload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub source: String,
    pub entry_point: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("program failed: {0}")]
    Program(String),

    #[error("program timed out after {0:?}")]
    Timeout(Duration),
}

impl SandboxError {
    /// A broken program stays broken; a missing sandbox or a slow host may not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SandboxError::Program(_))
    }
}

#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn run(&self, request: &SandboxRequest) -> Result<Payload, SandboxError>;
}
