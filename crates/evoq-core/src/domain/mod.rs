//! Domain model (ids, capabilities, tasks, results, retry decisions).

pub mod capability;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod result;
pub mod task;

pub use capability::{CapabilitySet, matches};
pub use decision::{Decision, RetryPolicy, decide};
pub use errors::ErrorKind;
pub use ids::{IdMarker, TaskId, WorkerId};
pub use result::{ResultStatus, TaskResult};
pub use task::{Payload, SCHEMA_VERSION, Task, TaskKind, UnknownTaskKind};
