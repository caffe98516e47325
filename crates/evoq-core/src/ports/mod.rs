//! Ports - the traits behind which brokers, stores, sandboxes and process
//! launchers sit.
//!
//! Everything above this layer (workers, spawner, reaper) talks to these
//! traits only, which keeps the orchestration logic broker-agnostic.

pub mod clock;
pub mod id_generator;
pub mod launcher;
pub mod result_store;
pub mod sandbox;
pub mod task_queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::launcher::{LaunchError, WorkerLauncher};
pub use self::result_store::{ResultStore, ResultStream, StoreError};
pub use self::sandbox::{ExecutionSandbox, SandboxError, SandboxRequest};
pub use self::task_queue::{DeadLetter, QueueCounts, QueueError, TaskQueue};
