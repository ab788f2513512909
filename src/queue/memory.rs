//! In-memory, bounded, non-durable queue with a single delivery task.

use super::{Batch, Delivery, EventQueue};
use crate::clock::{Clock, MonotonicClock};
use crate::error::SinkError;
use crate::flush::FlushTimeout;
use crate::policy::{RetryAttempt, RetryDecision};
use crate::record::Payload;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Default time `dispose` gives the delivery task to drain before aborting it.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Shared {
    buffer: Mutex<VecDeque<Payload>>,
    capacity: usize,
    max_batch: usize,
    /// Events ever accepted; only bumped while `buffer` is locked.
    enqueued: AtomicU64,
    /// Events delivered or abandoned, in queue order.
    completed: watch::Sender<u64>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, VecDeque<Payload>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_batch(&self) -> Vec<Payload> {
        let mut buffer = self.buffer();
        let n = buffer.len().min(self.max_batch);
        buffer.drain(..n).collect()
    }

    fn complete(&self, events: u64) {
        self.completed.send_modify(|done| *done += events);
    }
}

#[derive(Debug, Default)]
struct Worker {
    delivery: Option<Delivery>,
    started: bool,
    handle: Option<JoinHandle<()>>,
}

/// Bounded FIFO queue held in memory.
///
/// `enqueue` rejects events once `capacity` are buffered. One tokio task dequeues up to
/// `max_batch` events at a time and delivers them; batches are never delivered in parallel.
#[derive(Debug)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
    worker: Mutex<Worker>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    shutdown_timeout: Duration,
}

impl MemoryQueue {
    /// Queue holding at most `capacity` events (minimum 1), delivering batches of up to 512.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                max_batch: 512,
                enqueued: AtomicU64::new(0),
                completed: watch::Sender::new(0),
                wake: Notify::new(),
                shutdown: watch::Sender::new(false),
                disposed: AtomicBool::new(false),
            }),
            worker: Mutex::new(Worker::default()),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Queue that never reports saturation.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Largest batch handed to the consumer at once (minimum 1).
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.max_batch = max_batch.max(1);
        }
        self
    }

    /// Provide a custom sleeper for retry delays.
    pub fn with_sleeper<S: Sleeper + 'static>(self, sleeper: S) -> Self {
        self.with_shared_sleeper(Arc::new(sleeper))
    }

    /// Override the clock used to measure retry elapsed time and flush budgets.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the delivery task once both `register` and `start` have happened.
    fn spawn_if_ready(&self, worker: &mut Worker) {
        if !worker.started || worker.handle.is_some() || self.shared.disposed.load(Ordering::Acquire)
        {
            return;
        }
        let Some(delivery) = worker.delivery.clone() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                delivery.reporter.report("no tokio runtime; queue delivery not started", Some(&err));
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        let sleeper = Arc::clone(&self.sleeper);
        let clock = Arc::clone(&self.clock);
        worker.handle = Some(runtime.spawn(run(shared, delivery, sleeper, clock)));
        tracing::debug!(capacity = self.shared.capacity, "queue delivery task started");
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    fn enqueue(&self, event: Payload) -> bool {
        if self.shared.disposed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut buffer = self.shared.buffer();
            if buffer.len() >= self.shared.capacity {
                return false;
            }
            buffer.push_back(event);
            self.shared.enqueued.fetch_add(1, Ordering::AcqRel);
        }
        self.shared.wake.notify_one();
        true
    }

    fn register(&self, delivery: Delivery) {
        let mut worker = self.worker();
        worker.delivery = Some(delivery);
        self.spawn_if_ready(&mut worker);
    }

    fn start(&self) {
        let mut worker = self.worker();
        if worker.started {
            return;
        }
        worker.started = true;
        self.spawn_if_ready(&mut worker);
    }

    async fn flush(&self, timeout: FlushTimeout) -> bool {
        let started = self.clock.now_millis();
        let target = self.shared.enqueued.load(Ordering::Acquire);
        self.shared.wake.notify_one();

        let mut completed = self.shared.completed.subscribe();
        let drained = match timeout {
            FlushTimeout::Infinite => wait_completed(&mut completed, target).await,
            FlushTimeout::After(budget) if budget.is_zero() => *completed.borrow() >= target,
            FlushTimeout::After(budget) => {
                tokio::time::timeout(budget, wait_completed(&mut completed, target))
                    .await
                    .unwrap_or(false)
            }
        };

        let remaining = timeout.remaining(self.clock.since(started));
        let delivery = self.worker().delivery.clone();
        let downstream = match delivery {
            Some(delivery) => delivery.consumer.on_flushed(remaining).await,
            None => true,
        };
        if !drained {
            tracing::debug!(target, ?timeout, "queue flush timed out before draining");
        }
        drained && downstream
    }

    fn current_length(&self) -> Option<usize> {
        Some(self.shared.buffer().len())
    }

    async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.send_replace(true);

        let (handle, delivery) = {
            let mut worker = self.worker();
            (worker.handle.take(), worker.delivery.clone())
        };
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => tracing::debug!("queue delivery task stopped"),
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "queue delivery task failed");
                    if let Some(delivery) = &delivery {
                        delivery.reporter.report("queue delivery task failed", Some(&err));
                    }
                }
                Err(_) => {
                    handle.abort();
                    tracing::warn!(
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "queue delivery task did not stop in time; aborted"
                    );
                }
            }
        }

        let leftover = {
            let mut buffer = self.shared.buffer();
            let n = buffer.len();
            buffer.clear();
            n
        };
        if leftover > 0 {
            self.shared.complete(leftover as u64);
            let message = format!("queue disposed with {leftover} undelivered events");
            match delivery {
                Some(delivery) => delivery.reporter.report(&message, None),
                None => tracing::warn!("{message}"),
            }
        }
    }
}

async fn wait_completed(completed: &mut watch::Receiver<u64>, target: u64) -> bool {
    loop {
        if *completed.borrow_and_update() >= target {
            return true;
        }
        if completed.changed().await.is_err() {
            return false;
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    delivery: Delivery,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let items = shared.take_batch();
        if items.is_empty() {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        let events = items.len() as u64;
        tracing::debug!(events, "dequeued batch");
        deliver(&delivery, sleeper.as_ref(), clock.as_ref(), &mut shutdown, Batch::new(items))
            .await;
        shared.complete(events);
    }
}

/// Deliver one batch, retrying as the policy decides. Returns once the batch was delivered or
/// abandoned.
async fn deliver(
    delivery: &Delivery,
    sleeper: &dyn Sleeper,
    clock: &dyn Clock,
    shutdown: &mut watch::Receiver<bool>,
    batch: Batch,
) {
    let first_attempt = clock.now_millis();
    let mut attempt: u32 = 1;
    loop {
        let outcome = AssertUnwindSafe(delivery.consumer.deliver(&batch))
            .catch_unwind()
            .await
            .unwrap_or(Err(SinkError::Panicked));
        let error = match outcome {
            Ok(()) => {
                let notified = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    delivery.policy.on_success(&batch)
                }));
                if notified.is_err() {
                    delivery.reporter.report("error policy panicked in on_success", None);
                }
                return;
            }
            Err(error) => error,
        };

        let elapsed = clock.since(first_attempt);
        let decided = std::panic::catch_unwind(AssertUnwindSafe(|| {
            delivery.policy.on_failure(&RetryAttempt {
                batch: &batch,
                error: &error,
                attempt,
                elapsed,
            })
        }));
        let decision = match decided {
            Ok(decision) => decision,
            Err(_) => {
                let message = format!(
                    "error policy panicked in on_failure; batch of {} events abandoned",
                    batch.len()
                );
                delivery.reporter.report(&message, Some(&error));
                RetryDecision::Abandon
            }
        };
        let delay = match decision {
            RetryDecision::Abandon => {
                tracing::warn!(
                    events = batch.len(),
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "batch abandoned"
                );
                return;
            }
            RetryDecision::RetryAfter(delay) => delay,
        };

        let cancelled = if *shutdown.borrow() {
            true
        } else {
            tokio::select! {
                _ = sleeper.sleep(delay) => false,
                _ = shutdown.changed() => true,
            }
        };
        if cancelled {
            let message =
                format!("queue shutting down; retry cancelled, {} events discarded", batch.len());
            delivery.reporter.report(&message, Some(&error));
            return;
        }
        attempt = attempt.saturating_add(1);
    }
}
