//! LocalQueue - in-process TaskQueue for tests and offline runs.
//!
//! # Implementation
//! - One `tokio::sync::Mutex` guards pending, in-flight, results and the
//!   dead-letter list, so every operation sees a consistent snapshot.
//! - `Notify` wakes blocked `pop` calls on enqueue/release/reclaim.
//! - A second `Notify` wakes `wait_for_result` callers on every save.
//! - Claim times come from the injected `Clock`.
//!
//! # Usage
//! ```ignore
//! let queue = LocalQueue::new().with_clock(Arc::new(clock.clone()));
//! queue.enqueue(task).await?;
//! let claimed = queue.pop(true, Duration::from_secs(5)).await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{Decision, RetryPolicy, Task, TaskId, TaskKind, TaskResult};
use crate::ports::clock::to_delta;
use crate::ports::result_store::kind_matches;
use crate::ports::{
    Clock, DeadLetter, QueueCounts, QueueError, ResultStore, ResultStream, StoreError, SystemClock,
    TaskQueue,
};

struct Claim {
    task: Task,
    claimed_at: DateTime<Utc>,
}

#[derive(Default)]
struct LocalQueueState {
    pending: VecDeque<Task>,
    in_flight: HashMap<TaskId, Claim>,
    results: HashMap<TaskId, TaskResult>,
    dead: Vec<DeadLetter>,
}

impl LocalQueueState {
    fn knows(&self, task_id: &TaskId) -> bool {
        self.in_flight.contains_key(task_id)
            || self.pending.iter().any(|t| &t.id == task_id)
            || self.dead.iter().any(|d| &d.task.id == task_id)
    }
}

pub struct LocalQueue {
    state: Arc<Mutex<LocalQueueState>>,
    notify: Arc<Notify>,
    results_changed: Arc<Notify>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalQueueState::default())),
            notify: Arc::new(Notify::new()),
            results_changed: Arc::new(Notify::new()),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ids currently claimed, for assertions in tests.
    #[cfg(test)]
    pub(crate) async fn in_flight_ids(&self) -> Vec<TaskId> {
        let state = self.state.lock().await;
        let mut ids: Vec<TaskId> = state.in_flight.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            if state.knows(&task.id) {
                return Err(QueueError::DuplicateTask(task.id));
            }
            tracing::debug!(task_id = %task.id, kind = %task.kind, "enqueued");
            state.pending.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, block: bool, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(task) = state.pending.pop_front() {
                    let claim = Claim {
                        task: task.clone(),
                        claimed_at: self.clock.now(),
                    };
                    state.in_flight.insert(task.id.clone(), claim);
                    return Ok(Some(task));
                }
            }

            if !block {
                return Ok(None);
            }
            // A permit left by an earlier notify_one may wake us spuriously;
            // the loop re-checks pending.
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(task_id).is_some() {
            tracing::debug!(task_id = %task_id, "acked");
        }
        Ok(())
    }

    async fn release(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let released = {
            let mut state = self.state.lock().await;
            match state.in_flight.remove(task_id) {
                Some(claim) => {
                    state.pending.push_back(claim.task);
                    true
                }
                None => false,
            }
        };
        if released {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn push_result(&self, result: TaskResult) -> Result<(), QueueError> {
        self.save(&result).await?;
        Ok(())
    }

    async fn wait_for_result(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before looking so a save between the check and the
            // wait is not missed.
            let notified = self.results_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.state.lock().await.results.get(task_id) {
                return Ok(Some(result.clone()));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue_orphans(
        &self,
        idle_threshold: Duration,
        max_batch: usize,
    ) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let threshold = to_delta(idle_threshold);

        let requeued = {
            let mut state = self.state.lock().await;

            let mut stale: Vec<(DateTime<Utc>, TaskId)> = state
                .in_flight
                .iter()
                .filter(|(_, claim)| now.signed_duration_since(claim.claimed_at) > threshold)
                .map(|(id, claim)| (claim.claimed_at, id.clone()))
                .collect();
            stale.sort();
            stale.truncate(max_batch);

            let mut requeued = 0;
            for (_, task_id) in stale {
                let Some(claim) = state.in_flight.remove(&task_id) else {
                    continue;
                };
                let mut task = claim.task;
                task.bump_attempts();

                match self.retry.decide(task.attempts()) {
                    Decision::Retry => {
                        tracing::info!(task_id = %task.id, attempts = task.attempts(), "reclaimed orphan");
                        state.pending.push_back(task);
                        requeued += 1;
                    }
                    Decision::DeadLetter => {
                        tracing::warn!(task_id = %task.id, attempts = task.attempts(), "dead-lettered");
                        let reason = format!(
                            "attempts {} exceeded max_retry {}",
                            task.attempts(),
                            self.retry.max_retry
                        );
                        state.dead.push(DeadLetter {
                            task,
                            reason,
                            moved_at: now,
                        });
                    }
                }
            }
            requeued
        };

        for _ in 0..requeued {
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let oldest_pending_secs = state
            .pending
            .iter()
            .map(|t| t.created_at)
            .min()
            .map(|created| now.signed_duration_since(created).num_seconds().max(0) as u64);

        Ok(QueueCounts {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            dead: state.dead.len(),
            oldest_pending_secs,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn replay_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        {
            let mut state = self.state.lock().await;
            let Some(pos) = state.dead.iter().position(|d| &d.task.id == task_id) else {
                return Ok(false);
            };
            let task = state.dead.remove(pos).task;
            state.pending.push_back(task);
        }
        self.notify.notify_one();
        Ok(true)
    }

    async fn discard_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.dead.len();
        state.dead.retain(|d| &d.task.id != task_id);
        Ok(state.dead.len() != before)
    }
}

#[async_trait]
impl ResultStore for LocalQueue {
    async fn save(&self, result: &TaskResult) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .results
            .insert(result.task_id.clone(), result.clone());
        self.results_changed.notify_waiters();
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskResult>, StoreError> {
        Ok(self.state.lock().await.results.get(task_id).cloned())
    }

    /// Ids are listed up front in order; each result is looked up when the
    /// stream reaches it, so overwrites made meanwhile are seen.
    async fn iterate(&self, kind: Option<TaskKind>) -> Result<ResultStream, StoreError> {
        let mut ids: Vec<TaskId> = self.state.lock().await.results.keys().cloned().collect();
        ids.sort();

        let state = Arc::clone(&self.state);
        let results = stream::iter(ids).filter_map(move |id| {
            let state = Arc::clone(&state);
            async move {
                let result = state.lock().await.results.get(&id).cloned()?;
                kind_matches(&result, kind).then_some(Ok(result))
            }
        });
        Ok(Box::pin(results))
    }
}

/// Queue wrappers for exercising failure paths in code built on `TaskQueue`.
#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Delegates to a `LocalQueue`; can refuse results and counts pruning.
    pub(crate) struct InstrumentedQueue {
        pub inner: Arc<LocalQueue>,
        pub fail_push_result: bool,
        pub prune_calls: AtomicUsize,
    }

    impl InstrumentedQueue {
        pub fn new(inner: Arc<LocalQueue>) -> Self {
            Self {
                inner,
                fail_push_result: false,
                prune_calls: AtomicUsize::new(0),
            }
        }

        pub fn failing_results(mut self) -> Self {
            self.fail_push_result = true;
            self
        }

        pub fn prune_calls(&self) -> usize {
            self.prune_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskQueue for InstrumentedQueue {
        async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
            self.inner.enqueue(task).await
        }

        async fn pop(&self, block: bool, timeout: Duration) -> Result<Option<Task>, QueueError> {
            self.inner.pop(block, timeout).await
        }

        async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
            self.inner.ack(task_id).await
        }

        async fn release(&self, task_id: &TaskId) -> Result<(), QueueError> {
            self.inner.release(task_id).await
        }

        async fn push_result(&self, result: TaskResult) -> Result<(), QueueError> {
            if self.fail_push_result {
                return Err(QueueError::ResultPersist(StoreError::Backend(
                    "result store is read-only".into(),
                )));
            }
            self.inner.push_result(result).await
        }

        async fn wait_for_result(
            &self,
            task_id: &TaskId,
            timeout: Duration,
        ) -> Result<Option<TaskResult>, QueueError> {
            self.inner.wait_for_result(task_id, timeout).await
        }

        async fn requeue_orphans(
            &self,
            idle_threshold: Duration,
            max_batch: usize,
        ) -> Result<usize, QueueError> {
            self.inner.requeue_orphans(idle_threshold, max_batch).await
        }

        async fn counts(&self) -> Result<QueueCounts, QueueError> {
            self.inner.counts().await
        }

        async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
            self.inner.dead_letters(limit).await
        }

        async fn replay_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError> {
            self.inner.replay_dead_letter(task_id).await
        }

        async fn discard_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError> {
            self.inner.discard_dead_letter(task_id).await
        }

        async fn prune_idle_consumers(&self, _idle: Duration) -> Result<usize, QueueError> {
            self.prune_calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }
}
