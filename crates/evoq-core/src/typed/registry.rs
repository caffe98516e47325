//! HandlerRegistry - ordered, capability-tagged handler descriptors.
//!
//! Dispatch never branches on kind strings. A task goes to the first
//! registered handler that:
//! - declares the task's kind,
//! - passes the worker's optional allow-list,
//! - satisfies `task.requires ⊆ handler.provides ⊆ worker.caps`.
//!
//! Registration order is the tie-breaker, so register specialised handlers
//! (e.g. a `gpu` evaluator) before generic fallbacks.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::TaskInput;
use crate::domain::{CapabilitySet, Task, TaskKind, matches};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register<T: TaskInput, H: Handler<T> + 'static>(
        &mut self,
        name: impl Into<String>,
        provides: CapabilitySet,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::<T, H>::new(name, provides, handler)))
    }

    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        if self.handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(RegistryError::AlreadyRegistered(handler.name().to_string()));
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// First handler able to run `task` on a worker advertising `worker_caps`.
    pub fn select(
        &self,
        task: &Task,
        worker_caps: &CapabilitySet,
        allow_list: Option<&BTreeSet<String>>,
    ) -> Option<Arc<dyn DynHandler>> {
        self.handlers
            .iter()
            .find(|h| {
                h.kind() == task.kind
                    && allow_list.is_none_or(|allowed| allowed.contains(h.name()))
                    && matches(&task.requires, h.provides())
                    && matches(h.provides(), worker_caps)
            })
            .cloned()
    }

    pub fn kinds(&self) -> BTreeSet<TaskKind> {
        self.handlers.iter().map(|h| h.kind()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    /// Provided capabilities, in registration order.
    pub fn provides(&self) -> impl Iterator<Item = &CapabilitySet> {
        self.handlers.iter().map(|h| h.provides())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
