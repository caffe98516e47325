//! WarmSpawner - keeps enough one-shot workers alive for one capability class.
//!
//! # Per tick
//! 1. Read pending depth from the queue and live workers from the launcher.
//! 2. Launch `pending + desired_idle - live` workers, at most
//!    `max_parallel_launch` per tick.
//! 3. Optionally reclaim orphaned claims.
//!
//! The spawner never stops workers; they leave on their own idle timer. It
//! holds no task state either, so restarting it at any moment is safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::ports::{QueueError, TaskQueue, WorkerLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimConfig {
    /// Claims older than this are treated as orphaned.
    pub idle_threshold: Duration,
    pub max_batch: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(300),
            max_batch: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Capability class label, used in logs.
    pub class: String,
    pub poll_interval: Duration,
    pub desired_idle: usize,
    pub max_parallel_launch: usize,
    /// `None` when a dedicated reaper handles reclaim.
    pub reclaim: Option<ReclaimConfig>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            class: "default".to_string(),
            poll_interval: Duration::from_secs(2),
            desired_idle: 0,
            max_parallel_launch: 4,
            reclaim: Some(ReclaimConfig::default()),
        }
    }
}

impl SpawnerConfig {
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_desired_idle(mut self, n: usize) -> Self {
        self.desired_idle = n;
        self
    }

    pub fn with_max_parallel_launch(mut self, n: usize) -> Self {
        self.max_parallel_launch = n;
        self
    }

    pub fn with_reclaim(mut self, reclaim: Option<ReclaimConfig>) -> Self {
        self.reclaim = reclaim;
        self
    }
}

/// Workers to start this tick.
///
/// Busy workers are not part of the buffer: every pending task and every
/// wanted spare slot needs an idle worker of its own.
pub fn plan_launches(pending: usize, idle: usize, desired_idle: usize, max_parallel: usize) -> usize {
    pending
        .saturating_add(desired_idle)
        .saturating_sub(idle)
        .min(max_parallel)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pending: usize,
    pub in_flight: usize,
    pub live: usize,
    /// Live workers not holding a claim (best effort).
    pub idle: usize,
    pub launched: usize,
    pub launch_failures: usize,
    pub reclaimed: usize,
    /// Idle broker-side worker registrations dropped.
    pub pruned: usize,
}

pub struct WarmSpawner {
    queue: Arc<dyn TaskQueue>,
    launcher: Arc<dyn WorkerLauncher>,
    config: SpawnerConfig,
}

impl WarmSpawner {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        launcher: Arc<dyn WorkerLauncher>,
        config: SpawnerConfig,
    ) -> Self {
        Self {
            queue,
            launcher,
            config,
        }
    }

    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        let counts = self.queue.counts().await?;
        let live = self.launcher.live_workers().await;
        // Claims held by workers outside this launcher make this an
        // underestimate, which errs towards launching.
        let idle = live.saturating_sub(counts.in_flight);
        let mut report = TickReport {
            pending: counts.pending,
            in_flight: counts.in_flight,
            live,
            idle,
            ..TickReport::default()
        };

        let wanted = plan_launches(
            counts.pending,
            idle,
            self.config.desired_idle,
            self.config.max_parallel_launch,
        );
        for _ in 0..wanted {
            match self.launcher.launch().await {
                Ok(worker_id) => {
                    tracing::info!(class = %self.config.class, worker_id = %worker_id, "launched worker");
                    report.launched += 1;
                }
                Err(err) => {
                    // Retried on the next tick.
                    tracing::warn!(class = %self.config.class, error = %err, kind = %err.kind(), "launch failed");
                    report.launch_failures += 1;
                    break;
                }
            }
        }

        if let Some(reclaim) = self.config.reclaim {
            report.reclaimed = self
                .queue
                .requeue_orphans(reclaim.idle_threshold, reclaim.max_batch)
                .await?;
            match self.queue.prune_idle_consumers(reclaim.idle_threshold).await {
                Ok(pruned) => report.pruned = pruned,
                Err(err) => {
                    tracing::warn!(class = %self.config.class, error = %err, "consumer pruning failed")
                }
            }
        }

        tracing::debug!(
            class = %self.config.class,
            pending = report.pending,
            in_flight = report.in_flight,
            live = report.live,
            idle = report.idle,
            launched = report.launched,
            reclaimed = report.reclaimed,
            pruned = report.pruned,
            "spawner tick"
        );
        Ok(report)
    }

    /// Ticks until `shutdown` reads `true`. Tick errors are logged and the
    /// loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(class = %self.config.class, "spawner started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            if let Err(err) = self.tick().await {
                tracing::warn!(class = %self.config.class, error = %err, kind = %err.kind(), "spawner tick failed");
            }
        }
        tracing::info!(class = %self.config.class, "spawner stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    use super::*;
    use crate::domain::{Task, TaskId, TaskKind, WorkerId};
    use crate::impls::LocalQueue;
    use crate::ports::{FixedClock, LaunchError};

    #[rstest]
    #[case::nothing_to_do(0, 0, 0, 4, 0)]
    #[case::cold_start(3, 0, 0, 4, 3)]
    #[case::capped(10, 0, 0, 4, 4)]
    #[case::warm_pool(0, 0, 2, 4, 2)]
    #[case::enough_idle(2, 3, 1, 4, 0)]
    #[case::partial(5, 2, 1, 10, 4)]
    #[case::more_idle_than_needed(1, 9, 0, 4, 0)]
    #[case::all_busy_refills_buffer(0, 0, 2, 4, 2)]
    fn launch_plan(
        #[case] pending: usize,
        #[case] idle: usize,
        #[case] desired_idle: usize,
        #[case] max_parallel: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(plan_launches(pending, idle, desired_idle, max_parallel), expected);
    }

    /// Counts launches; the worker "process" never exits on its own.
    #[derive(Default)]
    struct CountingLauncher {
        live: AtomicUsize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl WorkerLauncher for CountingLauncher {
        async fn live_workers(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        async fn launch(&self) -> Result<WorkerId, LaunchError> {
            let n = self.live.load(Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(LaunchError::Quota("no more slots".into()));
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(WorkerId::new(format!("worker-{n}")))
        }
    }

    async fn queue_with(n: usize) -> Arc<LocalQueue> {
        let queue = Arc::new(LocalQueue::new());
        for i in 0..n {
            queue
                .enqueue(Task::new(TaskId::new(format!("t-{i}")), TaskKind::Render, Utc::now()))
                .await
                .unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn tick_launches_up_to_demand() {
        let queue = queue_with(3).await;
        let launcher = Arc::new(CountingLauncher::default());
        let spawner = WarmSpawner::new(
            queue,
            launcher.clone(),
            SpawnerConfig::default().with_desired_idle(1).with_reclaim(None),
        );

        let first = spawner.tick().await.unwrap();
        assert_eq!(first.launched, 4);
        let second = spawner.tick().await.unwrap();
        assert_eq!(second.launched, 0);
        assert_eq!(second.live, 4);
    }

    #[tokio::test]
    async fn busy_workers_do_not_count_as_spare_capacity() {
        let queue = queue_with(4).await;
        for _ in 0..4 {
            queue.pop(false, Duration::ZERO).await.unwrap().unwrap();
        }
        let launcher = Arc::new(CountingLauncher::default());
        launcher.live.store(4, Ordering::SeqCst);
        let spawner = WarmSpawner::new(
            queue,
            launcher,
            SpawnerConfig::default().with_desired_idle(2).with_reclaim(None),
        );

        let report = spawner.tick().await.unwrap();
        assert_eq!((report.pending, report.in_flight, report.live), (0, 4, 4));
        assert_eq!(report.idle, 0);
        assert_eq!(report.launched, 2);
    }

    #[tokio::test]
    async fn launch_failure_stops_the_tick() {
        let queue = queue_with(5).await;
        let launcher = Arc::new(CountingLauncher {
            fail_after: Some(2),
            ..Default::default()
        });
        let spawner = WarmSpawner::new(queue, launcher, SpawnerConfig::default().with_reclaim(None));

        let report = spawner.tick().await.unwrap();
        assert_eq!(report.launched, 2);
        assert_eq!(report.launch_failures, 1);
    }

    #[tokio::test]
    async fn tick_reclaims_orphans() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
        let queue = Arc::new(LocalQueue::new().with_clock(clock.clone()));
        queue
            .enqueue(Task::new(TaskId::new("t-1"), TaskKind::Render, Utc::now()))
            .await
            .unwrap();
        queue.pop(false, Duration::ZERO).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(400));

        let spawner = WarmSpawner::new(
            queue.clone(),
            Arc::new(CountingLauncher::default()),
            SpawnerConfig::default().with_max_parallel_launch(0),
        );
        let report = spawner.tick().await.unwrap();
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(queue.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let queue = queue_with(0).await;
        let spawner = WarmSpawner::new(
            queue,
            Arc::new(CountingLauncher::default()),
            SpawnerConfig::default().with_poll_interval(Duration::from_millis(5)),
        );
        let (tx, rx) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(true).unwrap();
        };
        tokio::join!(spawner.run(rx), stopper);
    }
}
