//! App - orchestration built on the ports.
//!
//! # Components
//! - **WorkerBuilder / WorkerTemplate**: wiring and fail-fast validation
//! - **OneShotWorker**: claim, dispatch, publish, exit
//! - **WarmSpawner**: launches workers to match demand, reclaims orphans
//! - **ReaperLoop**: reclaim only, for deployments that split the two

pub mod builder;
pub mod reaper_loop;
pub mod spawner;
pub mod worker;

pub use self::builder::{BuildError, WorkerBuilder, WorkerTemplate};
pub use self::reaper_loop::{ReaperConfig, ReaperLoop};
pub use self::spawner::{ReclaimConfig, SpawnerConfig, TickReport, WarmSpawner, plan_launches};
pub use self::worker::{
    ExitReason, OneShotWorker, WorkerConfig, WorkerError, WorkerExit, WorkerState,
};
