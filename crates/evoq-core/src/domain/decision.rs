//! Retry decision: what happens to a reclaimed task.
//!
//! Workers never retry in-process. When a claim goes stale, the queue bumps
//! `attempts` and asks this module whether the task goes back to pending or
//! to the dead-letter channel. Keeping it a pure function of
//! `(attempts, max_retry)` means it can be tested without a broker.

/// The next action for a reclaimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Put it back into the pending set.
    Retry,

    /// Give up and park it in the dead-letter channel.
    DeadLetter,
}

/// `attempts` is the value *after* the reclaim increment.
pub fn decide(attempts: u32, max_retry: u32) -> Decision {
    if attempts > max_retry {
        Decision::DeadLetter
    } else {
        Decision::Retry
    }
}

/// Retry budget shared by a queue's reclaim path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reclaims tolerated before a task is dead-lettered.
    pub max_retry: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRY: u32 = 3;

    pub fn new(max_retry: u32) -> Self {
        Self { max_retry }
    }

    pub fn decide(&self, attempts: u32) -> Decision {
        decide(attempts, self.max_retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_RETRY)
    }
}
