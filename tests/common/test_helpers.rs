use async_trait::async_trait;
use spool::policy::{ErrorPolicy, RetryAttempt, RetryDecision};
use spool::{Batch, FlushTimeout, Flushable, ManualClock, Payload, Sink, SinkError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Message of a record, or the text of an encoded payload.
pub fn text(payload: &Payload) -> String {
    match payload {
        Payload::Record(record) => record.message(),
        Payload::Encoded(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[derive(Debug, Default)]
struct Script {
    failures: usize,
    attempts: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
    closes: AtomicUsize,
    flushes: Mutex<Vec<FlushTimeout>>,
}

/// Fails its first `failures` appends, then records every batch. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSink {
    script: Arc<Script>,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        Self { script: Arc::new(Script { failures, ..Script::default() }) }
    }

    pub fn attempts(&self) -> usize {
        self.script.attempts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.script.batches.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.batches().concat()
    }

    pub fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> Vec<FlushTimeout> {
        self.script.flushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Flushable for ScriptedSink {
    async fn flush(&self, timeout: FlushTimeout) -> bool {
        self.script.flushes.lock().unwrap().push(timeout);
        true
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn append(&self, batch: &Batch) -> Result<(), SinkError> {
        let attempt = self.script.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.script.failures {
            return Err(SinkError::rejected(format!("scripted failure {attempt}")));
        }
        self.script.batches.lock().unwrap().push(batch.iter().map(text).collect());
        Ok(())
    }

    async fn close(&self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blocks every append until a permit is released.
#[derive(Debug, Clone)]
pub struct GatedSink {
    permits: Arc<Semaphore>,
    delivered: Arc<Mutex<Vec<String>>>,
}

impl GatedSink {
    pub fn closed() -> Self {
        Self { permits: Arc::new(Semaphore::new(0)), delivered: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Let `appends` more batches through.
    pub fn open(&self, appends: usize) {
        self.permits.add_permits(appends);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Flushable for GatedSink {
    async fn flush(&self, _timeout: FlushTimeout) -> bool {
        true
    }
}

#[async_trait]
impl Sink for GatedSink {
    async fn append(&self, batch: &Batch) -> Result<(), SinkError> {
        let permit = self.permits.acquire().await.map_err(SinkError::other)?;
        permit.forget();
        self.delivered.lock().unwrap().extend(batch.iter().map(text));
        Ok(())
    }
}

/// Flush target whose flush costs `cost` on a shared manual clock.
#[derive(Debug)]
pub struct SlowFlushTarget {
    clock: ManualClock,
    cost: Duration,
    seen: Mutex<Vec<FlushTimeout>>,
}

impl SlowFlushTarget {
    pub fn new(clock: &ManualClock, cost_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            clock: clock.clone(),
            cost: Duration::from_millis(cost_ms),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<FlushTimeout> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Flushable for SlowFlushTarget {
    async fn flush(&self, timeout: FlushTimeout) -> bool {
        self.seen.lock().unwrap().push(timeout);
        if timeout.is_zero() {
            return true;
        }
        let spent = timeout.as_duration().map_or(self.cost, |budget| budget.min(self.cost));
        self.clock.advance(spent);
        spent == self.cost
    }
}

#[async_trait]
impl Sink for SlowFlushTarget {
    async fn append(&self, _batch: &Batch) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Records every callback before deferring to the wrapped policy.
#[derive(Debug)]
pub struct RecordingPolicy<P> {
    inner: P,
    failures: Mutex<Vec<u32>>,
    successes: AtomicUsize,
}

impl<P: ErrorPolicy> RecordingPolicy<P> {
    pub fn new(inner: P) -> Arc<Self> {
        Arc::new(Self { inner, failures: Mutex::new(Vec::new()), successes: AtomicUsize::new(0) })
    }

    /// Attempt numbers seen by `on_failure`, in order.
    pub fn failures(&self) -> Vec<u32> {
        self.failures.lock().unwrap().clone()
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }
}

impl<P: ErrorPolicy> ErrorPolicy for RecordingPolicy<P> {
    fn on_failure(&self, attempt: &RetryAttempt<'_>) -> RetryDecision {
        self.failures.lock().unwrap().push(attempt.attempt);
        self.inner.on_failure(attempt)
    }

    fn on_success(&self, batch: &Batch) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.inner.on_success(batch);
    }
}
