//! Typed - payload types, handlers, the registry and the wire codec.
//!
//! # Two layers
//! - **Typed**: `TaskInput` and `Handler<T>`. Payloads are decoded into a
//!   concrete type before a handler sees them.
//! - **Dyn**: `DynHandler`. Object-safe, kept in the `HandlerRegistry`.

pub mod codec;
pub mod execute;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::{
    WireError, check_schema, decode_result, decode_task, encode_result, encode_task,
};
pub use self::execute::ExecuteHandler;
pub use self::handler::{DynHandler, Handler, HandlerError, Outcome, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::TaskInput;
