//! Retry/abandon decisions for failed batch deliveries.
//!
//! Semantics:
//! - The queue's delivery loop calls [`ErrorPolicy::on_failure`] after every failed attempt,
//!   with a 1-based attempt count and the time elapsed since the first attempt at that batch.
//! - [`RetryDecision::RetryAfter`] makes the loop wait and retry the *same* batch;
//!   [`RetryDecision::Abandon`] drops it and moves on. The loop imposes no ceiling of its own.
//! - [`ErrorPolicy::on_success`] runs after every successful delivery.
//!
//! Example
//! ```rust
//! use spool::policy::{ConstantRetryPolicy, ErrorPolicy, RetryAttempt, RetryDecision};
//! use spool::{Batch, SinkError};
//! use std::time::Duration;
//!
//! let policy = ConstantRetryPolicy::builder()
//!     .retry_delay(Duration::from_millis(10))
//!     .max_retries(2)
//!     .build();
//! let batch = Batch::new(vec!["line".into()]);
//! let error = SinkError::rejected("busy");
//! let attempt = RetryAttempt { batch: &batch, error: &error, attempt: 1, elapsed: Duration::ZERO };
//! assert_eq!(policy.on_failure(&attempt), RetryDecision::RetryAfter(Duration::from_millis(10)));
//! ```

use crate::error::SinkError;
use crate::queue::Batch;
use crate::report::{ErrorReporter, TracingReporter};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One failed delivery attempt, as seen by an [`ErrorPolicy`].
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    pub batch: &'a Batch,
    pub error: &'a SinkError,
    /// 1 for the first delivery attempt.
    pub attempt: u32,
    /// Monotonic time since the first attempt at this batch.
    pub elapsed: Duration,
}

/// What the delivery loop should do with a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abandon,
}

/// Decides, per failed batch, whether to retry and after what delay.
pub trait ErrorPolicy: Send + Sync + fmt::Debug {
    fn on_failure(&self, attempt: &RetryAttempt<'_>) -> RetryDecision;

    fn on_success(&self, _batch: &Batch) {}
}

/// Retries with a constant delay up to `max_retries` times, then abandons.
///
/// Remembers whether the last batch was abandoned and reports recovery on the next success.
pub struct ConstantRetryPolicy {
    retry_delay: Option<Duration>,
    max_retries: u32,
    reporter: Arc<dyn ErrorReporter>,
    last_failed: AtomicBool,
    discarded: AtomicU64,
}

impl fmt::Debug for ConstantRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantRetryPolicy")
            .field("retry_delay", &self.retry_delay)
            .field("max_retries", &self.max_retries)
            .field("last_failed", &self.last_failed.load(Ordering::Relaxed))
            .field("discarded", &self.discarded.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ConstantRetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConstantRetryPolicy {
    pub fn builder() -> ConstantRetryPolicyBuilder {
        ConstantRetryPolicyBuilder::new()
    }

    /// `None` when retries are disabled.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Events dropped by abandoned batches so far.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Whether the most recent batch was abandoned.
    pub fn last_failed(&self) -> bool {
        self.last_failed.load(Ordering::Acquire)
    }
}

impl ErrorPolicy for ConstantRetryPolicy {
    fn on_failure(&self, attempt: &RetryAttempt<'_>) -> RetryDecision {
        match self.retry_delay {
            Some(delay) if attempt.attempt <= self.max_retries => {
                tracing::debug!(
                    attempt = attempt.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %attempt.error,
                    "batch delivery failed, retrying"
                );
                RetryDecision::RetryAfter(delay)
            }
            _ => {
                let events = attempt.batch.len();
                self.discarded.fetch_add(events as u64, Ordering::Relaxed);
                self.last_failed.store(true, Ordering::Release);
                let message = format!(
                    "discarded {events} events after {} attempts over {} ms",
                    attempt.attempt,
                    attempt.elapsed.as_millis()
                );
                self.reporter.report(&message, Some(attempt.error));
                RetryDecision::Abandon
            }
        }
    }

    fn on_success(&self, batch: &Batch) {
        if self.last_failed.swap(false, Ordering::AcqRel) {
            tracing::info!(events = batch.len(), "sink recovered, delivering again");
            self.reporter.report("sink recovered after earlier discards", None);
        }
    }
}

/// Builder for [`ConstantRetryPolicy`].
#[derive(Debug, Clone)]
pub struct ConstantRetryPolicyBuilder {
    retry_delay: Option<Duration>,
    max_retries: u32,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl ConstantRetryPolicyBuilder {
    /// Defaults: 1 s delay, 3 retries, diagnostics to `tracing`.
    pub fn new() -> Self {
        Self { retry_delay: Some(Duration::from_secs(1)), max_retries: 3, reporter: None }
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Signed milliseconds; any negative value disables retries.
    pub fn retry_delay_millis(mut self, millis: i64) -> Self {
        self.retry_delay = u64::try_from(millis).ok().map(Duration::from_millis);
        self
    }

    /// Abandon every batch after its first failure.
    pub fn disable_retries(mut self) -> Self {
        self.retry_delay = None;
        self
    }

    /// Retries allowed beyond the first attempt.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> ConstantRetryPolicy {
        ConstantRetryPolicy {
            retry_delay: self.retry_delay,
            max_retries: self.max_retries,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(TracingReporter)),
            last_failed: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        }
    }
}

impl Default for ConstantRetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
