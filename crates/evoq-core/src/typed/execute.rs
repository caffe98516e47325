//! `execute` handler: runs candidate source through an `ExecutionSandbox`.

use async_trait::async_trait;

use super::handler::{Handler, HandlerError, Outcome};
use crate::domain::Task;
use crate::ports::{ExecutionSandbox, SandboxRequest};

pub struct ExecuteHandler<S> {
    sandbox: S,
}

impl<S: ExecutionSandbox> ExecuteHandler<S> {
    pub fn new(sandbox: S) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl<S: ExecutionSandbox> Handler<SandboxRequest> for ExecuteHandler<S> {
    async fn handle(&self, input: SandboxRequest, task: &Task) -> Result<Outcome, HandlerError> {
        match self.sandbox.run(&input).await {
            Ok(metrics) => Ok(Outcome::Done(metrics)),
            Err(err) => {
                tracing::debug!(task_id = %task.id, error = %err, "sandbox run failed");
                Err(HandlerError::Failed {
                    retryable: err.is_retryable(),
                    message: err.to_string(),
                })
            }
        }
    }
}
