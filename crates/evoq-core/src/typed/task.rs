//! TaskInput trait - binds a payload type to the task kind it belongs to.

use serde::de::DeserializeOwned;

use crate::domain::TaskKind;
use crate::ports::SandboxRequest;

/// A typed view of a task payload.
///
/// ```ignore
/// #[derive(Deserialize)]
/// struct RenderInput {
///     template: String,
/// }
///
/// impl TaskInput for RenderInput {
///     const KIND: TaskKind = TaskKind::Render;
/// }
/// ```
///
/// The payload map is decoded into `Self` right before the handler runs, so a
/// payload of the wrong shape surfaces as a terminal handler error.
pub trait TaskInput: DeserializeOwned + Send + Sync + 'static {
    const KIND: TaskKind;
}

impl TaskInput for SandboxRequest {
    const KIND: TaskKind = TaskKind::Execute;
}
