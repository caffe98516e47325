//! ReaperLoop - dedicated orphan reclaimer.
//!
//! Runs `requeue_orphans` on a fixed interval. Use it when spawners run with
//! reclaim switched off, e.g. one reaper per namespace instead of one reclaim
//! per spawner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::spawner::ReclaimConfig;
use crate::ports::{QueueError, TaskQueue};

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub poll_interval: Duration,
    pub reclaim: ReclaimConfig,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            reclaim: ReclaimConfig::default(),
        }
    }
}

impl ReaperConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reclaim(mut self, reclaim: ReclaimConfig) -> Self {
        self.reclaim = reclaim;
        self
    }
}

pub struct ReaperLoop {
    queue: Arc<dyn TaskQueue>,
    config: ReaperConfig,
}

impl ReaperLoop {
    pub fn new(queue: Arc<dyn TaskQueue>, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    /// One reclaim pass; returns how many claims went back to pending.
    ///
    /// Also drops idle worker registrations left behind by exited workers.
    pub async fn tick(&self) -> Result<usize, QueueError> {
        let reclaimed = self
            .queue
            .requeue_orphans(self.config.reclaim.idle_threshold, self.config.reclaim.max_batch)
            .await?;
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reaper requeued orphans");
        }
        match self
            .queue
            .prune_idle_consumers(self.config.reclaim.idle_threshold)
            .await
        {
            Ok(0) => {}
            Ok(pruned) => tracing::info!(pruned, "reaper pruned idle consumers"),
            Err(err) => tracing::warn!(error = %err, "consumer pruning failed"),
        }
        Ok(reclaimed)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

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
                tracing::warn!(error = %err, kind = %err.kind(), "reaper tick failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskId, TaskKind};
    use crate::impls::LocalQueue;
    use crate::impls::local_queue::fixtures::InstrumentedQueue;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn tick_requeues_stale_claims_once() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
        let queue = Arc::new(LocalQueue::new().with_clock(clock.clone()));
        for id in ["t-1", "t-2"] {
            queue
                .enqueue(Task::new(TaskId::new(id), TaskKind::Mutate, Utc::now()))
                .await
                .unwrap();
            queue.pop(false, Duration::ZERO).await.unwrap().unwrap();
        }
        clock.advance(Duration::from_secs(301));

        let reaper = ReaperLoop::new(queue.clone(), ReaperConfig::default());
        assert_eq!(reaper.tick().await.unwrap(), 2);
        assert_eq!(reaper.tick().await.unwrap(), 0);

        let t = queue.pop(false, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(t.attempts(), 1);
    }

    #[tokio::test]
    async fn tick_prunes_idle_consumers() {
        let queue = Arc::new(InstrumentedQueue::new(Arc::new(LocalQueue::new())));
        let reaper = ReaperLoop::new(queue.clone(), ReaperConfig::default());
        reaper.tick().await.unwrap();
        reaper.tick().await.unwrap();
        assert_eq!(queue.prune_calls(), 2);
    }

    #[tokio::test]
    async fn run_exits_when_sender_is_dropped() {
        let queue = Arc::new(LocalQueue::new());
        let reaper = ReaperLoop::new(
            queue,
            ReaperConfig::default().with_poll_interval(Duration::from_millis(5)),
        );
        let (tx, rx) = watch::channel(false);
        drop(tx);
        reaper.run(rx).await;
    }
}
