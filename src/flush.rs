//! Flush budgets and coordinated flushing of several downstream targets.

use crate::clock::{Clock, MonotonicClock};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// How long a flush may block.
///
/// `ZERO` means "trigger the flush but do not wait"; `Infinite` waits until done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTimeout {
    After(Duration),
    Infinite,
}

impl FlushTimeout {
    pub const ZERO: FlushTimeout = FlushTimeout::After(Duration::ZERO);

    /// Signed milliseconds; negative values clamp to zero.
    pub fn from_millis(millis: i64) -> Self {
        FlushTimeout::After(Duration::from_millis(millis.max(0).unsigned_abs()))
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Budget left after `elapsed` has been spent. Infinite stays infinite.
    pub fn remaining(self, elapsed: Duration) -> Self {
        match self {
            FlushTimeout::After(budget) => FlushTimeout::After(budget.saturating_sub(elapsed)),
            FlushTimeout::Infinite => FlushTimeout::Infinite,
        }
    }

    /// The finite budget, if any.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            FlushTimeout::After(budget) => Some(budget),
            FlushTimeout::Infinite => None,
        }
    }
}

impl From<Duration> for FlushTimeout {
    fn from(budget: Duration) -> Self {
        FlushTimeout::After(budget)
    }
}

/// Something that can be asked to hand off everything it buffers.
#[async_trait]
pub trait Flushable: Send + Sync {
    /// Returns `true` if everything was handed off within `timeout`.
    async fn flush(&self, timeout: FlushTimeout) -> bool;
}

/// Flushes a set of targets within one overall budget.
///
/// All targets are kicked concurrently with a zero-wait flush first, bounded by the overall
/// budget, then each is waited on in turn with whatever budget is left. A failing target does not stop the others
/// from being waited on.
#[derive(Debug, Clone)]
pub struct FlushCoordinator {
    clock: Arc<dyn Clock>,
}

impl Default for FlushCoordinator {
    fn default() -> Self {
        Self { clock: Arc::new(MonotonicClock::default()) }
    }
}

impl FlushCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn flush_all<T>(&self, targets: &[Arc<T>], timeout: FlushTimeout) -> bool
    where
        T: Flushable + ?Sized,
    {
        if targets.is_empty() {
            return true;
        }
        let started = self.clock.now_millis();

        if !timeout.is_zero() {
            let kicks = join_all(targets.iter().map(|target| target.flush(FlushTimeout::ZERO)));
            match timeout.as_duration() {
                Some(budget) => {
                    if tokio::time::timeout(budget, kicks).await.is_err() {
                        tracing::debug!(?budget, "flush kick used up the whole budget");
                    }
                }
                None => {
                    kicks.await;
                }
            }
        }

        let mut all_flushed = true;
        for (index, target) in targets.iter().enumerate() {
            let budget = timeout.remaining(self.clock.since(started));
            if !target.flush(budget).await {
                tracing::debug!(target_index = index, ?budget, "downstream flush incomplete");
                all_flushed = false;
            }
        }
        all_flushed
    }
}
