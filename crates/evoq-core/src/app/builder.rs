//! WorkerBuilder - wires handlers and config into a reusable WorkerTemplate.
//!
//! # Fail-fast
//! `expect_kinds()` lists the task kinds this deployment must be able to run.
//! `build()` refuses to produce a template when any of them has no registered
//! handler, so a misconfigured worker fails at start-up instead of silently
//! releasing every task it claims.

use std::sync::Arc;

use crate::app::worker::{OneShotWorker, WorkerConfig};
use crate::domain::{CapabilitySet, TaskKind, WorkerId, matches};
use crate::ports::{Clock, SystemClock, TaskQueue};
use crate::typed::{DynHandler, Handler, HandlerRegistry, RegistryError, TaskInput};

/// # Usage
/// ```ignore
/// let template = WorkerBuilder::new()
///     .register::<SandboxRequest, _>("execute", CapabilitySet::parse("docker"), ExecuteHandler::new(sandbox))?
///     .with_config(WorkerConfig::default().with_capabilities(caps))
///     .expect_kinds(&[TaskKind::Execute])
///     .build()?;
/// let exit = template.worker(queue, worker_id).run().await?;
/// ```
pub struct WorkerBuilder {
    registry: HandlerRegistry,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
    expected_kinds: Option<Vec<TaskKind>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no handler registered for task kinds {0:?}")]
    MissingKinds(Vec<TaskKind>),
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config: WorkerConfig::default(),
            clock: Arc::new(SystemClock),
            expected_kinds: None,
        }
    }

    pub fn register<T: TaskInput, H: Handler<T> + 'static>(
        mut self,
        name: impl Into<String>,
        provides: CapabilitySet,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(name, provides, handler)?;
        Ok(self)
    }

    pub fn register_dyn(mut self, handler: Arc<dyn DynHandler>) -> Result<Self, RegistryError> {
        self.registry.register_dyn(handler)?;
        Ok(self)
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn expect_kinds(mut self, kinds: &[TaskKind]) -> Self {
        self.expected_kinds = Some(kinds.to_vec());
        self
    }

    pub fn build(self) -> Result<WorkerTemplate, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let registered = self.registry.kinds();
            let missing: Vec<TaskKind> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }

        for name in self.unreachable_handlers() {
            tracing::warn!(
                handler = %name,
                caps = %self.config.capabilities,
                "handler needs capabilities this worker does not advertise"
            );
        }

        Ok(WorkerTemplate {
            registry: Arc::new(self.registry),
            config: self.config,
            clock: self.clock,
        })
    }

    fn unreachable_handlers(&self) -> Vec<String> {
        self.registry
            .names()
            .into_iter()
            .zip(self.registry.provides())
            .filter(|(_, provides)| !matches(provides, &self.config.capabilities))
            .map(|(name, _)| name)
            .collect()
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to start workers of one configuration. Cheap to clone.
#[derive(Clone)]
pub struct WorkerTemplate {
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
}

impl WorkerTemplate {
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn worker(&self, queue: Arc<dyn TaskQueue>, id: WorkerId) -> OneShotWorker {
        OneShotWorker::new(
            id,
            queue,
            Arc::clone(&self.registry),
            self.config.clone(),
            Arc::clone(&self.clock),
        )
    }
}
