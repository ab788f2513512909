//! Lock-free counters describing what happened to dispatched events.
//!
//! Counters are monotonically increasing and read with relaxed ordering; a [`StatsSnapshot`] is
//! therefore only approximately consistent across fields while producers are running.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters updated by the engine and its queue consumer.
#[derive(Debug, Default)]
pub struct DispatchStats {
    accepted: AtomicU64,
    filtered: AtomicU64,
    format_discarded: AtomicU64,
    gate_dropped: AtomicU64,
    recursive_dropped: AtomicU64,
    overflowed: AtomicU64,
    closed_appends: AtomicU64,
    hook_failures: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    abandoned: AtomicU64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    bump! {
        add_accepted => accepted,
        add_filtered => filtered,
        add_format_discarded => format_discarded,
        add_gate_dropped => gate_dropped,
        add_recursive_dropped => recursive_dropped,
        add_overflowed => overflowed,
        add_closed_appends => closed_appends,
        add_hook_failures => hook_failures,
        add_delivered => delivered,
        add_failed_attempts => failed_attempts,
        add_abandoned => abandoned,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            format_discarded: self.format_discarded.load(Ordering::Relaxed),
            gate_dropped: self.gate_dropped.load(Ordering::Relaxed),
            recursive_dropped: self.recursive_dropped.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            closed_appends: self.closed_appends.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events that passed the accept predicate.
    pub accepted: u64,
    /// Events rejected by the accept predicate.
    pub filtered: u64,
    /// Events the formatter turned into nothing.
    pub format_discarded: u64,
    /// Events dropped because the sink was not ready.
    pub gate_dropped: u64,
    /// Nested dispatches dropped by the re-entrancy guard.
    pub recursive_dropped: u64,
    /// Events rejected by a saturated queue.
    pub overflowed: u64,
    /// Dispatch calls made after close.
    pub closed_appends: u64,
    /// Events lost to a failing or panicking hook.
    pub hook_failures: u64,
    /// Events the sink accepted.
    pub delivered: u64,
    /// Failed `append` attempts, retries included.
    pub failed_attempts: u64,
    /// Events in batches the error policy gave up on.
    pub abandoned: u64,
}

impl StatsSnapshot {
    /// Events an enabled engine took in and then discarded: in a failing hook, at the readiness
    /// gate, on overflow, by the formatter or by the error policy.
    ///
    /// Events still buffered when the queue is disposed are reported but not counted here.
    pub fn dropped(&self) -> u64 {
        self.format_discarded
            + self.gate_dropped
            + self.overflowed
            + self.hook_failures
            + self.abandoned
    }
}
