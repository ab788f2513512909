//! Buffering between producers and the sink.
//!
//! An [`EventQueue`] accepts formatted events without ever blocking the producer and delivers
//! them, in insertion order and in batches, to a registered [`BatchConsumer`] from its own
//! background task. Failed deliveries are retried or abandoned as the registered
//! [`ErrorPolicy`] decides.
//!
//! Lifecycle: [`register`](EventQueue::register) wires the consumer, [`start`](EventQueue::start)
//! allows dequeuing to begin, [`dispose`](EventQueue::dispose) stops the delivery task. Events
//! enqueued before `start` are held, not drained.

pub mod memory;

pub use memory::MemoryQueue;

use crate::error::SinkError;
use crate::flush::FlushTimeout;
use crate::policy::ErrorPolicy;
use crate::record::Payload;
use crate::report::ErrorReporter;
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::Arc;

/// An ordered group of formatted events delivered together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    items: Vec<Payload>,
}

impl Batch {
    pub fn new(items: Vec<Payload>) -> Self {
        Self { items }
    }

    pub fn into_vec(self) -> Vec<Payload> {
        self.items
    }
}

impl Deref for Batch {
    type Target = [Payload];

    fn deref(&self) -> &[Payload] {
        &self.items
    }
}

impl From<Vec<Payload>> for Batch {
    fn from(items: Vec<Payload>) -> Self {
        Self::new(items)
    }
}

impl IntoIterator for Batch {
    type Item = Payload;
    type IntoIter = std::vec::IntoIter<Payload>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Receives batches from a queue's delivery task.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    /// Deliver one non-empty batch.
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError>;

    /// Called after the queue drained for a flush, with the budget that is left. Returning
    /// `false` marks the flush as failed.
    async fn on_flushed(&self, remaining: FlushTimeout) -> bool;
}

/// Everything a queue needs to deliver on its own.
#[derive(Clone)]
pub struct Delivery {
    pub consumer: Arc<dyn BatchConsumer>,
    pub policy: Arc<dyn ErrorPolicy>,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").field("policy", &self.policy).finish_non_exhaustive()
    }
}

/// Buffers formatted events and delivers them in batches.
#[async_trait]
pub trait EventQueue: Send + Sync + std::fmt::Debug {
    /// Add an event. Returns `false` when the queue is saturated or disposed; never blocks.
    fn enqueue(&self, event: Payload) -> bool;

    /// Wire the consumer, policy and reporter used by the delivery task.
    fn register(&self, delivery: Delivery);

    /// Allow dequeuing to begin. Idempotent.
    fn start(&self);

    /// Wait until everything enqueued before this call was delivered or abandoned, then let the
    /// consumer flush downstream with the remaining budget.
    async fn flush(&self, timeout: FlushTimeout) -> bool;

    /// Best-effort depth, or `None` if the backing store cannot tell.
    fn current_length(&self) -> Option<usize>;

    /// Stop the delivery task and release resources. Safe without a prior `start`.
    async fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_preserves_insertion_order() {
        let batch = Batch::new(vec!["a".into(), "b".into(), "c".into()]);
        let texts: Vec<_> = batch.iter().filter_map(|p| p.as_bytes().cloned()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(batch.len(), 3);
    }
}
