//! OneShotWorker - claims a task, runs one handler, publishes, exits.
//!
//! # State machine
//! ```text
//! Idle -> Claimed -> Executing -> {Succeeded | Failed} -> Acked -> Exited
//! Idle -> Exited                  (idle timeout, max uptime, shutdown)
//! ```
//!
//! # Rules
//! - The worker never retries. Retry and dead-letter decisions belong to the
//!   queue's reclaim path.
//! - Capability matching is recomputed for every claim.
//! - A panicking handler is a fault: the task stays unacked and the worker
//!   exits non-zero, so reclaim hands the task to someone else later.
//! - Shutdown never interrupts a handler. The current task finishes, its
//!   result is published and acked, then the worker exits.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::{CapabilitySet, ResultStatus, Task, TaskId, TaskResult, WorkerId, matches};
use crate::ports::{Clock, QueueError, TaskQueue};
use crate::typed::{HandlerRegistry, Outcome, check_schema};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Advertised capability tags.
    pub capabilities: CapabilitySet,
    /// Only handlers named here may run. `None` allows every handler.
    pub handler_allow_list: Option<BTreeSet<String>>,
    pub tasks_per_process: usize,
    /// Exit after this long without claiming a runnable task.
    pub idle_timeout: Duration,
    /// Stop taking new tasks after this long.
    pub max_uptime: Option<Duration>,
    /// Upper bound for a single blocking pop.
    pub poll_timeout: Duration,
    /// Pause after handing back a task this worker cannot run.
    pub reject_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capabilities: CapabilitySet::new(),
            handler_allow_list: None,
            tasks_per_process: 1,
            idle_timeout: Duration::from_secs(60),
            max_uptime: None,
            poll_timeout: Duration::from_secs(5),
            reject_backoff: Duration::from_millis(200),
        }
    }
}

impl WorkerConfig {
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_handler_allow_list<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handler_allow_list = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_tasks_per_process(mut self, n: usize) -> Self {
        self.tasks_per_process = n.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_uptime(mut self, uptime: Option<Duration>) -> Self {
        self.max_uptime = uptime;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_reject_backoff(mut self, backoff: Duration) -> Self {
        self.reject_backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claimed,
    Executing,
    Succeeded,
    Failed,
    Acked,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `tasks_per_process` tasks were completed.
    Completed,
    IdleTimeout,
    MaxUptime,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub reason: ExitReason,
    pub completed: usize,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("handler '{handler}' faulted on task {task_id}: {message}")]
    HandlerFault {
        handler: String,
        task_id: TaskId,
        message: String,
    },
}

impl WorkerError {
    /// Process exit status (sysexits: 69 unavailable, 70 software).
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Queue(_) => 69,
            WorkerError::HandlerFault { .. } => 70,
        }
    }
}

/// What became of one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// A result was published; counts towards `tasks_per_process`.
    Finished,
    /// Handed back without a result; the worker is still idle.
    Rejected,
}

pub struct OneShotWorker {
    id: WorkerId,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
    // Keeps the default channel open when no external shutdown is wired.
    _shutdown_tx: Option<watch::Sender<bool>>,
    state: WorkerState,
}

impl OneShotWorker {
    pub fn new(
        id: WorkerId,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            id,
            queue,
            registry,
            config,
            clock,
            shutdown: rx,
            _shutdown_tx: Some(tx),
            state: WorkerState::Idle,
        }
    }

    /// Wire an external shutdown signal; `true` asks the worker to stop.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self._shutdown_tx = None;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, next: WorkerState) {
        tracing::trace!(worker_id = %self.id, from = ?self.state, to = ?next, "state");
        self.state = next;
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn run(mut self) -> Result<WorkerExit, WorkerError> {
        let started = Instant::now();
        let mut idle_since = Instant::now();
        let mut completed = 0usize;
        tracing::info!(
            worker_id = %self.id,
            caps = %self.config.capabilities,
            handlers = self.registry.len(),
            "worker started"
        );

        let reason = loop {
            if self.shutdown_requested() {
                break ExitReason::Shutdown;
            }
            if completed >= self.config.tasks_per_process {
                break ExitReason::Completed;
            }
            let uptime_left = match self.config.max_uptime {
                Some(max) => max.saturating_sub(started.elapsed()),
                None => Duration::MAX,
            };
            if uptime_left.is_zero() {
                break ExitReason::MaxUptime;
            }
            let idle_left = self.config.idle_timeout.saturating_sub(idle_since.elapsed());
            if idle_left.is_zero() {
                break ExitReason::IdleTimeout;
            }

            let wait = self.config.poll_timeout.min(idle_left).min(uptime_left);
            let mut shutdown = self.shutdown.clone();
            let popped = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => continue,
                popped = self.queue.pop(true, wait) => popped?,
            };
            let Some(task) = popped else {
                continue;
            };

            self.set_state(WorkerState::Claimed);
            match self.process(task).await {
                Ok(Disposition::Finished) => {
                    completed += 1;
                    idle_since = Instant::now();
                }
                Ok(Disposition::Rejected) => {
                    tokio::time::sleep(self.config.reject_backoff).await;
                }
                Err(err) => {
                    self.set_state(WorkerState::Exited);
                    tracing::error!(worker_id = %self.id, error = %err, "worker aborting");
                    return Err(err);
                }
            }
            self.set_state(WorkerState::Idle);
        };

        self.set_state(WorkerState::Exited);
        tracing::info!(worker_id = %self.id, ?reason, completed, "worker exiting");
        Ok(WorkerExit { reason, completed })
    }

    async fn process(&mut self, task: Task) -> Result<Disposition, WorkerError> {
        let caps = self.config.capabilities.clone();

        if !matches(&task.requires, &caps) {
            tracing::debug!(
                worker_id = %self.id,
                task_id = %task.id,
                requires = %task.requires,
                "capabilities missing, releasing"
            );
            self.queue.release(&task.id).await?;
            return Ok(Disposition::Rejected);
        }

        if let Err(err) = check_schema(&task) {
            tracing::warn!(worker_id = %self.id, task_id = %task.id, error = %err, "refusing task");
            let result = TaskResult::error(&task, err.to_string(), false).at(self.clock.now());
            self.queue.push_result(result).await?;
            self.queue.ack(&task.id).await?;
            self.set_state(WorkerState::Acked);
            return Ok(Disposition::Finished);
        }

        let Some(handler) =
            self.registry
                .select(&task, &caps, self.config.handler_allow_list.as_ref())
        else {
            tracing::debug!(
                worker_id = %self.id,
                task_id = %task.id,
                kind = %task.kind,
                "no matching handler, releasing"
            );
            self.queue.release(&task.id).await?;
            return Ok(Disposition::Rejected);
        };

        self.set_state(WorkerState::Executing);
        tracing::info!(
            worker_id = %self.id,
            task_id = %task.id,
            kind = %task.kind,
            attempts = task.attempts(),
            handler = handler.name(),
            "executing"
        );

        // Run on its own task so a panic is caught at the join instead of
        // unwinding through the worker.
        let joined = {
            let handler = Arc::clone(&handler);
            let task = task.clone();
            tokio::spawn(async move { handler.handle_dyn(&task).await }).await
        };

        let result = match joined {
            Ok(Ok(Outcome::Done(data))) => TaskResult::ok(&task, data),
            Ok(Ok(Outcome::Skip(reason))) => TaskResult::skip(&task, reason),
            Ok(Err(err)) => TaskResult::error(&task, err.to_string(), err.is_retryable()),
            Err(join_err) => {
                self.set_state(WorkerState::Failed);
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                return Err(WorkerError::HandlerFault {
                    handler: handler.name().to_string(),
                    task_id: task.id,
                    message,
                });
            }
        }
        .at(self.clock.now());

        self.set_state(match result.status {
            ResultStatus::Error => WorkerState::Failed,
            ResultStatus::Ok | ResultStatus::Skip => WorkerState::Succeeded,
        });
        let status = result.status;
        let retryable = result.is_retryable();
        self.queue.push_result(result).await?;

        match status {
            ResultStatus::Ok => {
                self.queue.ack(&task.id).await?;
                self.set_state(WorkerState::Acked);
            }
            ResultStatus::Error if !retryable => {
                self.queue.ack(&task.id).await?;
                self.set_state(WorkerState::Acked);
            }
            ResultStatus::Error => {
                tracing::info!(task_id = %task.id, "retryable error, leaving claim for reclaim");
            }
            ResultStatus::Skip => {
                self.queue.release(&task.id).await?;
            }
        }
        tracing::info!(worker_id = %self.id, task_id = %task.id, ?status, "task finished");
        Ok(Disposition::Finished)
    }
}

/// Resolves once the flag reads `true`. A closed channel never resolves.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SCHEMA_VERSION, TaskKind};
    use crate::impls::LocalQueue;
    use crate::impls::local_queue::fixtures::InstrumentedQueue;
    use crate::ports::{FixedClock, ResultStore};
    use crate::typed::handler::fixtures::{PanicHandler, RenderHandler, ScoreHandler, SkipHandler};
    use crate::typed::task::fixtures::{RenderInput, ScoreInput};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()))
    }

    fn fast_config(caps: &str) -> WorkerConfig {
        WorkerConfig::default()
            .with_capabilities(CapabilitySet::parse(caps))
            .with_idle_timeout(Duration::from_millis(100))
            .with_poll_timeout(Duration::from_millis(20))
            .with_reject_backoff(Duration::from_millis(1))
    }

    fn registry() -> Arc<HandlerRegistry> {
        let mut reg = HandlerRegistry::new();
        reg.register::<ScoreInput, _>("score-gpu", CapabilitySet::parse("gpu"), ScoreHandler)
            .unwrap();
        reg.register::<ScoreInput, _>("score-cpu", CapabilitySet::parse("cpu"), ScoreHandler)
            .unwrap();
        reg.register::<RenderInput, _>("render", CapabilitySet::new(), RenderHandler)
            .unwrap();
        Arc::new(reg)
    }

    fn worker(queue: &Arc<LocalQueue>, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> OneShotWorker {
        OneShotWorker::new(
            WorkerId::new("worker-test"),
            Arc::clone(queue) as Arc<dyn TaskQueue>,
            registry,
            config,
            clock(),
        )
    }

    fn score_task(id: &str) -> Task {
        Task::new(TaskId::new(id), TaskKind::Evaluate, Utc::now()).with_field("candidate", json!("abcd"))
    }

    #[tokio::test]
    async fn unpersisted_result_stops_worker_and_keeps_claim() {
        let local = Arc::new(LocalQueue::new());
        local.enqueue(score_task("t-1")).await.unwrap();
        let queue = Arc::new(InstrumentedQueue::new(local.clone()).failing_results());

        let err = OneShotWorker::new(
            WorkerId::new("worker-test"),
            queue as Arc<dyn TaskQueue>,
            registry(),
            fast_config("cpu"),
            clock(),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, WorkerError::Queue(QueueError::ResultPersist(_))));
        assert_eq!(err.exit_code(), 69);
        assert_eq!(local.in_flight_ids().await, vec![TaskId::new("t-1")]);
        assert!(local.get(&TaskId::new("t-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completes_one_task_then_exits() {
        let queue = Arc::new(LocalQueue::new());
        queue.enqueue(score_task("t-1")).await.unwrap();
        queue.enqueue(score_task("t-2")).await.unwrap();

        let exit = worker(&queue, registry(), fast_config("cpu")).run().await.unwrap();
        assert_eq!(exit, WorkerExit { reason: ExitReason::Completed, completed: 1 });

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.pending, counts.in_flight), (1, 0));
        let result = queue.get(&TaskId::new("t-1")).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.data["score"], json!(4));
    }

    #[tokio::test]
    async fn idle_worker_times_out() {
        let queue = Arc::new(LocalQueue::new());
        let exit = worker(&queue, registry(), fast_config("cpu")).run().await.unwrap();
        assert_eq!(exit.reason, ExitReason::IdleTimeout);
        assert_eq!(exit.completed, 0);
    }

    #[tokio::test]
    async fn cpu_worker_releases_gpu_task() {
        let queue = Arc::new(LocalQueue::new());
        let gpu = score_task("t-gpu").with_requires(CapabilitySet::parse("gpu"));
        queue.enqueue(gpu).await.unwrap();

        let exit = worker(&queue, registry(), fast_config("cpu")).run().await.unwrap();
        assert_eq!(exit.reason, ExitReason::IdleTimeout);

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.pending, counts.in_flight), (1, 0));
        assert!(queue.get(&TaskId::new("t-gpu")).await.unwrap().is_none());

        let again = queue.pop(false, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.attempts(), 0);
    }

    #[tokio::test]
    async fn gpu_worker_prefers_gpu_handler() {
        let queue = Arc::new(LocalQueue::new());
        queue
            .enqueue(score_task("t-gpu").with_requires(CapabilitySet::parse("gpu")))
            .await
            .unwrap();
        let exit = worker(&queue, registry(), fast_config("gpu,cpu")).run().await.unwrap();
        assert_eq!(exit.reason, ExitReason::Completed);
    }

    #[tokio::test]
    async fn allow_list_excludes_handlers() {
        let queue = Arc::new(LocalQueue::new());
        queue.enqueue(score_task("t-1")).await.unwrap();
        let config = fast_config("cpu").with_handler_allow_list(["render"]);

        let exit = worker(&queue, registry(), config).run().await.unwrap();
        assert_eq!(exit.reason, ExitReason::IdleTimeout);
        assert_eq!(queue.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn terminal_error_is_acked_retryable_is_not() {
        let queue = Arc::new(LocalQueue::new());
        queue
            .enqueue(score_task("t-bad").with_field("fail", json!("syntax error")))
            .await
            .unwrap();
        queue
            .enqueue(
                score_task("t-flaky")
                    .with_field("fail", json!("gpu busy"))
                    .with_field("retryable", json!(true)),
            )
            .await
            .unwrap();

        let config = fast_config("cpu").with_tasks_per_process(2);
        let exit = worker(&queue, registry(), config).run().await.unwrap();
        assert_eq!(exit.completed, 2);

        let bad = queue.get(&TaskId::new("t-bad")).await.unwrap().unwrap();
        assert!(!bad.is_retryable());
        let flaky = queue.get(&TaskId::new("t-flaky")).await.unwrap().unwrap();
        assert!(flaky.is_retryable());

        assert_eq!(queue.in_flight_ids().await, vec![TaskId::new("t-flaky")]);
    }

    #[tokio::test]
    async fn skip_result_releases_task() {
        let queue = Arc::new(LocalQueue::new());
        queue.enqueue(score_task("t-1")).await.unwrap();
        let mut reg = HandlerRegistry::new();
        reg.register::<ScoreInput, _>("skipper", CapabilitySet::new(), SkipHandler)
            .unwrap();

        let exit = worker(&queue, Arc::new(reg), fast_config("")).run().await.unwrap();
        assert_eq!(exit.reason, ExitReason::Completed);

        let result = queue.get(&TaskId::new("t-1")).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Skip);
        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.pending, counts.in_flight), (1, 0));
    }

    #[tokio::test]
    async fn newer_schema_gets_terminal_error() {
        let queue = Arc::new(LocalQueue::new());
        let mut task = score_task("t-future");
        task.schema_version = SCHEMA_VERSION + 1;
        queue.enqueue(task).await.unwrap();

        let exit = worker(&queue, registry(), fast_config("cpu")).run().await.unwrap();
        assert_eq!(exit.completed, 1);

        let result = queue.get(&TaskId::new("t-future")).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Error);
        assert!(!result.is_retryable());
        assert!(queue.in_flight_ids().await.is_empty());
    }

    #[tokio::test]
    async fn panic_leaves_task_unacked_and_fails_worker() {
        let queue = Arc::new(LocalQueue::new());
        queue.enqueue(score_task("t-1")).await.unwrap();
        let mut reg = HandlerRegistry::new();
        reg.register::<ScoreInput, _>("explodes", CapabilitySet::new(), PanicHandler)
            .unwrap();

        let err = worker(&queue, Arc::new(reg), fast_config("")).run().await.unwrap_err();
        assert!(matches!(&err, WorkerError::HandlerFault { message, .. } if message == "evaluator blew up"));
        assert_eq!(err.exit_code(), 70);

        assert_eq!(queue.in_flight_ids().await, vec![TaskId::new("t-1")]);
        assert!(queue.get(&TaskId::new("t-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crashed_task_is_reclaimed_and_finished_by_next_worker() {
        let clock = clock();
        let queue = Arc::new(LocalQueue::new().with_clock(clock.clone()));
        queue.enqueue(score_task("t-1")).await.unwrap();

        let mut reg = HandlerRegistry::new();
        reg.register::<ScoreInput, _>("explodes", CapabilitySet::new(), PanicHandler)
            .unwrap();
        worker(&queue, Arc::new(reg), fast_config("")).run().await.unwrap_err();

        clock.advance(Duration::from_secs(600));
        assert_eq!(
            queue.requeue_orphans(Duration::from_secs(300), 10).await.unwrap(),
            1
        );

        let exit = worker(&queue, registry(), fast_config("cpu")).run().await.unwrap();
        assert_eq!(exit.reason, ExitReason::Completed);
        let result = queue.get(&TaskId::new("t-1")).await.unwrap().unwrap();
        assert_eq!(result.attempts_used, 2);
    }

    #[tokio::test]
    async fn shutdown_before_claim_exits_cleanly() {
        let queue = Arc::new(LocalQueue::new());
        let (tx, rx) = watch::channel(false);
        let config = fast_config("cpu").with_idle_timeout(Duration::from_secs(30));
        let handle = tokio::spawn(worker(&queue, registry(), config).with_shutdown(rx).run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit.reason, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn max_uptime_stops_taking_work() {
        let queue = Arc::new(LocalQueue::new());
        let config = fast_config("cpu")
            .with_idle_timeout(Duration::from_secs(30))
            .with_max_uptime(Some(Duration::from_millis(50)));

        let exit = worker(&queue, registry(), config).run().await.unwrap();
        assert_eq!(exit.reason, ExitReason::MaxUptime);
    }
}
