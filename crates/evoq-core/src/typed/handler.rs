//! Handler traits.
//!
//! - `Handler<T>`: what application code implements, typed over its input.
//! - `DynHandler`: object-safe form stored in the registry.
//! - `TypedHandler<T, H>`: erases `T` by decoding the payload map first.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::task::TaskInput;
use crate::domain::{CapabilitySet, ErrorKind, Payload, Task, TaskKind};

/// What a handler produced on a normal return.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Finished; the map becomes the result `data`.
    Done(Payload),

    /// Not for this worker. The task goes back unacked for someone else.
    Skip(String),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload is not a valid {expected}: {source}")]
    Payload {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{message}")]
    Failed { message: String, retryable: bool },
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Payload { .. } => false,
            HandlerError::Failed { retryable, .. } => *retryable,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_retryable() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

/// Typed handler for one input type.
///
/// ```ignore
/// struct Renderer;
///
/// #[async_trait]
/// impl Handler<RenderInput> for Renderer {
///     async fn handle(&self, input: RenderInput, _task: &Task) -> Result<Outcome, HandlerError> {
///         Ok(Outcome::Done(render(&input.template)))
///     }
/// }
/// ```
///
/// Handlers may run more than once for the same task (after a crash the task
/// is reclaimed and handed out again), so they must be idempotent.
#[async_trait]
pub trait Handler<T: TaskInput>: Send + Sync {
    async fn handle(&self, input: T, task: &Task) -> Result<Outcome, HandlerError>;
}

/// Object-safe handler descriptor: name, kind and provided capabilities.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TaskKind;

    fn provides(&self) -> &CapabilitySet;

    async fn handle_dyn(&self, task: &Task) -> Result<Outcome, HandlerError>;
}

pub struct TypedHandler<T: TaskInput, H: Handler<T>> {
    name: String,
    provides: CapabilitySet,
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: TaskInput, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(name: impl Into<String>, provides: CapabilitySet, handler: H) -> Self {
        Self {
            name: name.into(),
            provides,
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TaskInput, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        T::KIND
    }

    fn provides(&self) -> &CapabilitySet {
        &self.provides
    }

    async fn handle_dyn(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let input: T = serde_json::from_value(Value::Object(task.payload.clone())).map_err(
            |source| HandlerError::Payload {
                expected: std::any::type_name::<T>(),
                source,
            },
        )?;
        self.handler.handle(input, task).await
    }
}
