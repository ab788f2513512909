//! The consumer side of the engine: where formatted batches finally go.
//!
//! A [`Sink`] is the transport (file, socket, broker). The engine only relies on the contract
//! below: `append` may fail and will be retried by the queue's error policy, and `flush` must be
//! safe to call while an `append` is in flight.

use crate::error::SinkError;
use crate::flush::{FlushCoordinator, FlushTimeout, Flushable};
use crate::queue::Batch;
use crate::record::{Level, Payload};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Transport for formatted batches.
#[async_trait]
pub trait Sink: Flushable {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "sink"
    }

    /// Called once when the owning engine is activated. An error leaves the engine disabled.
    async fn activate(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Pre-dispatch gate: `false` makes the engine drop events without formatting them.
    fn is_ready(&self) -> bool {
        true
    }

    /// Deliver a non-empty batch, preserving its order.
    async fn append(&self, batch: &Batch) -> Result<(), SinkError>;

    /// Teardown hook, called once when the owning engine closes.
    async fn close(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl Flushable for NullSink {
    async fn flush(&self, _timeout: FlushTimeout) -> bool {
        true
    }
}

#[async_trait]
impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn append(&self, _batch: &Batch) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps delivered payloads in memory, evicting the oldest past `capacity`.
/// Clones share the same storage.
#[derive(Debug, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<Payload>>>,
    capacity: usize,
    batches: Arc<AtomicU64>,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            batches: Arc::new(AtomicU64::new(0)),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<Payload> {
        self.events.lock().map(|e| e.iter().cloned().collect()).unwrap_or_default()
    }

    /// Messages of delivered records, or the UTF-8 text of encoded payloads.
    pub fn messages(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|p| match p {
                Payload::Record(record) => record.message(),
                Payload::Encoded(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `append` calls received.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Flushable for MemorySink {
    async fn flush(&self, _timeout: FlushTimeout) -> bool {
        true
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut events = self.events.lock().map_err(|_| SinkError::rejected("memory sink poisoned"))?;
        for event in batch.iter() {
            if events.len() >= self.capacity {
                events.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event.clone());
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Re-emits every payload as a `tracing` event under the `spool::sink` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl Flushable for TracingSink {
    async fn flush(&self, _timeout: FlushTimeout) -> bool {
        true
    }
}

#[async_trait]
impl Sink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn append(&self, batch: &Batch) -> Result<(), SinkError> {
        for event in batch.iter() {
            match event {
                Payload::Record(record) => {
                    let message = record.message();
                    let target = record.target();
                    match record.level() {
                        Level::Trace => tracing::trace!(target: "spool::sink", logger = target, "{message}"),
                        Level::Debug => tracing::debug!(target: "spool::sink", logger = target, "{message}"),
                        Level::Info => tracing::info!(target: "spool::sink", logger = target, "{message}"),
                        Level::Warn => tracing::warn!(target: "spool::sink", logger = target, "{message}"),
                        Level::Error | Level::Fatal => {
                            tracing::error!(target: "spool::sink", logger = target, "{message}")
                        }
                    }
                }
                Payload::Encoded(bytes) => {
                    tracing::info!(target: "spool::sink", "{}", String::from_utf8_lossy(bytes))
                }
            }
        }
        Ok(())
    }
}

/// Forwards every batch to several downstream sinks.
///
/// `append` tries every target and fails if any of them failed, so a retry re-delivers to all
/// of them (at-least-once per target). `flush` goes through [`FlushCoordinator`].
#[derive(Clone)]
pub struct FanoutSink {
    targets: Vec<Arc<dyn Sink>>,
    coordinator: FlushCoordinator,
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.targets.iter().map(|t| t.name()).collect();
        f.debug_struct("FanoutSink").field("targets", &names).finish()
    }
}

impl FanoutSink {
    pub fn new(targets: Vec<Arc<dyn Sink>>) -> Self {
        Self { targets, coordinator: FlushCoordinator::new() }
    }

    pub fn with_coordinator(mut self, coordinator: FlushCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn targets(&self) -> &[Arc<dyn Sink>] {
        &self.targets
    }
}

#[async_trait]
impl Flushable for FanoutSink {
    async fn flush(&self, timeout: FlushTimeout) -> bool {
        self.coordinator.flush_all(&self.targets, timeout).await
    }
}

#[async_trait]
impl Sink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn activate(&self) -> Result<(), SinkError> {
        for target in &self.targets {
            target.activate().await?;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.targets.iter().any(|t| t.is_ready())
    }

    async fn append(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut failed = 0;
        for target in &self.targets {
            if let Err(err) = target.append(batch).await {
                tracing::warn!(sink = target.name(), error = %err, "fan-out target append failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(SinkError::Fanout { failed, total: self.targets.len() });
        }
        Ok(())
    }

    async fn close(&self) {
        for target in &self.targets {
            target.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecord;

    fn batch(messages: &[&'static str]) -> Batch {
        Batch::new(messages.iter().map(|m| Payload::from(*m)).collect())
    }

    #[derive(Debug, Default)]
    struct Broken;

    #[async_trait]
    impl Flushable for Broken {
        async fn flush(&self, _timeout: FlushTimeout) -> bool {
            false
        }
    }

    #[async_trait]
    impl Sink for Broken {
        fn is_ready(&self) -> bool {
            false
        }

        async fn append(&self, _batch: &Batch) -> Result<(), SinkError> {
            Err(SinkError::rejected("down"))
        }
    }

    #[tokio::test]
    async fn memory_sink_keeps_order_and_evicts_oldest() {
        let sink = MemorySink::with_capacity(3);
        sink.append(&batch(&["a", "b"])).await.unwrap();
        sink.append(&batch(&["c", "d"])).await.unwrap();

        assert_eq!(sink.messages(), vec!["b", "c", "d"]);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.batches(), 2);
    }

    #[tokio::test]
    async fn memory_sink_renders_record_messages() {
        let sink = MemorySink::new();
        let record = LogRecord::new(Level::Info, "app", "hello");
        sink.append(&Batch::new(vec![record.into()])).await.unwrap();
        assert_eq!(sink.messages(), vec!["hello"]);
    }

    #[tokio::test]
    async fn fanout_delivers_to_healthy_targets_and_reports_failures() {
        let healthy = MemorySink::new();
        let targets: Vec<Arc<dyn Sink>> = vec![Arc::new(healthy.clone()), Arc::new(Broken)];
        let fanout = FanoutSink::new(targets);

        let err = fanout.append(&batch(&["x"])).await.unwrap_err();
        assert!(matches!(err, SinkError::Fanout { failed: 1, total: 2 }));
        assert_eq!(healthy.messages(), vec!["x"]);
        assert!(fanout.is_ready());
    }

    #[tokio::test]
    async fn fanout_flush_fails_if_any_target_fails() {
        let failing: Vec<Arc<dyn Sink>> = vec![Arc::new(MemorySink::new()), Arc::new(Broken)];
        let fanout = FanoutSink::new(failing);
        assert!(!fanout.flush(FlushTimeout::from_millis(50)).await);

        let passing: Vec<Arc<dyn Sink>> = vec![Arc::new(MemorySink::new()), Arc::new(NullSink)];
        let healthy = FanoutSink::new(passing);
        assert!(healthy.flush(FlushTimeout::from_millis(50)).await);
    }

    #[tokio::test]
    async fn tracing_sink_accepts_every_shape() {
        let mixed = Batch::new(vec![
            LogRecord::new(Level::Error, "app", "boom").into(),
            Payload::from("encoded line"),
        ]);
        assert!(TracingSink.append(&mixed).await.is_ok());
    }
}
