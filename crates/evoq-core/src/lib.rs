//! evoq-core
//!
//! Task distribution and worker orchestration: capability-routed tasks,
//! at-least-once delivery, single-use workers and orphan reclaim.
//!
//! # Modules
//! - **domain**: tasks, results, capability sets, ids, retry decisions
//! - **ports**: `TaskQueue`, `ResultStore`, `ExecutionSandbox`, `WorkerLauncher`, `Clock`
//! - **typed**: typed handlers, the handler registry and the wire codec
//! - **impls**: local and Redis queues, file result store, launchers
//! - **app**: one-shot worker, warm-spawner, reaper

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;
