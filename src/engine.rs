//! The dispatch engine: accept, format, then hand events to a sink directly or through a queue.
//!
//! Semantics:
//! - `dispatch` never fails and never blocks on the sink in asynchronous mode. Everything that
//!   goes wrong is routed to the [`ErrorReporter`].
//! - Filtering, formatting and enqueueing run under one engine-wide lock, so the sink sees
//!   events in the order `dispatch` calls acquired it.
//! - A hook that dispatches into the engine it is running for gets its nested events dropped.
//! - The queue is started lazily by the first `dispatch` call, not by `activate`.
//!
//! Example
//! ```rust
//! use spool::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), spool::ConfigError> {
//! let sink = MemorySink::new();
//! let engine = DispatchEngine::builder()
//!     .name("app")
//!     .sink(sink.clone())
//!     .formatter(TextFormatter::new())
//!     .build()?;
//! engine.activate().await?;
//!
//! engine.dispatch(LogRecord::new(Level::Info, "app::db", "connected")).await;
//! assert!(engine.flush(FlushTimeout::from_millis(1_000)).await);
//! assert!(sink.messages()[0].ends_with("app::db - connected"));
//!
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineOptions;
use crate::error::{ConfigError, HookError, SinkError};
use crate::flush::{FlushTimeout, Flushable};
use crate::hooks::{AcceptAll, AcceptPredicate, Formatter, IdentityFormatter};
use crate::policy::{ConstantRetryPolicy, ErrorPolicy, RetryAttempt, RetryDecision};
use crate::queue::{Batch, BatchConsumer, Delivery, EventQueue, MemoryQueue};
use crate::record::{FixFlags, Payload, ProducerContext};
use crate::report::{ErrorReporter, TracingReporter};
use crate::sink::Sink;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stats::{DispatchStats, StatsSnapshot};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Mutex;

static NEXT_ENGINE_ID: AtomicUsize = AtomicUsize::new(1);

/// Where an engine is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Unconfigured = 0,
    Configuring = 1,
    Enabled = 2,
    /// Activation failed or was repeated; the engine accepts calls and does nothing.
    Disabled = 3,
    /// Terminal.
    Closed = 4,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Unconfigured,
            1 => LifecycleState::Configuring,
            2 => LifecycleState::Enabled,
            3 => LifecycleState::Disabled,
            _ => LifecycleState::Closed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Configuring => "configuring",
            LifecycleState::Enabled => "enabled",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Marks engines whose hooks are running on the current thread.
mod reentrancy {
    use std::cell::RefCell;

    thread_local! {
        static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn is_active(engine: usize) -> bool {
        ACTIVE.with(|active| active.borrow().contains(&engine))
    }

    /// Held only across synchronous code: a task can move threads at an await point.
    pub(super) struct Section {
        engine: usize,
    }

    impl Section {
        /// `None` if the engine already has a section open on this thread.
        pub(super) fn enter(engine: usize) -> Option<Self> {
            ACTIVE.with(|active| {
                let mut active = active.borrow_mut();
                if active.contains(&engine) {
                    return None;
                }
                active.push(engine);
                Some(Section { engine })
            })
        }
    }

    impl Drop for Section {
        fn drop(&mut self) {
            ACTIVE.with(|active| active.borrow_mut().retain(|id| *id != self.engine));
        }
    }
}

/// Polls `inner` with the engine's section open, so a sink that dispatches into the engine
/// while appending synchronously is treated like a re-entrant hook.
struct InSection<F> {
    engine: usize,
    inner: F,
}

impl<F: Future + Unpin> Future for InSection<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _section = reentrancy::Section::enter(self.engine);
        Pin::new(&mut self.inner).poll(cx)
    }
}

fn guarded<T>(
    hook: &'static str,
    run: impl FnOnce() -> Result<T, HookError>,
) -> Result<T, HookError> {
    std::panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or(Err(HookError::Panicked(hook)))
}

#[derive(Clone)]
struct Settings {
    asynchronous: bool,
    fix: FixFlags,
    queue: Arc<dyn EventQueue>,
    policy: Arc<dyn ErrorPolicy>,
    accept: Arc<dyn AcceptPredicate>,
    formatter: Arc<dyn Formatter>,
}

struct EngineCore {
    state: LifecycleState,
    started: bool,
    settings: Settings,
}

/// Where `flush` goes once the engine is enabled. Fixed at activation.
#[derive(Clone)]
enum FlushRoute {
    Queue(Arc<dyn EventQueue>),
    Sink,
}

/// Front door for producers.
pub struct DispatchEngine {
    id: usize,
    name: Arc<str>,
    core: Mutex<EngineCore>,
    state: AtomicU8,
    flush_route: RwLock<Option<FlushRoute>>,
    sink: Arc<dyn Sink>,
    reporter: Arc<dyn ErrorReporter>,
    stats: Arc<DispatchStats>,
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("sink", &self.sink.name())
            .finish_non_exhaustive()
    }
}

impl DispatchEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock-free view of the lifecycle state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Best-effort depth of the configured queue; `None` if it cannot tell.
    pub async fn queue_length(&self) -> Option<usize> {
        let queue = Arc::clone(&self.core.lock().await.settings.queue);
        queue.current_length()
    }

    fn set_state(&self, core: &mut EngineCore, state: LifecycleState) {
        core.state = state;
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_flush_route(&self, route: Option<FlushRoute>) {
        *self.flush_route.write().unwrap_or_else(PoisonError::into_inner) = route;
    }

    fn report_config(&self, err: &ConfigError) {
        tracing::warn!(engine = %self.name, error = %err, "engine configuration rejected");
        self.reporter.report(&format!("engine `{}` configuration error", self.name), Some(err));
    }

    /// Transition Unconfigured -> Enabled, or -> Disabled if the sink's activation fails.
    ///
    /// Any call after the first reports [`ConfigError::AlreadyActivated`] and leaves the engine
    /// disabled.
    pub async fn activate(&self) -> Result<(), ConfigError> {
        let mut core = self.core.lock().await;
        match core.state {
            LifecycleState::Unconfigured => {}
            LifecycleState::Closed => {
                let err = ConfigError::Closed;
                self.report_config(&err);
                return Err(err);
            }
            _ => {
                let err = ConfigError::AlreadyActivated;
                self.report_config(&err);
                self.set_state(&mut core, LifecycleState::Disabled);
                return Err(err);
            }
        }
        self.set_state(&mut core, LifecycleState::Configuring);

        let activated = AssertUnwindSafe(self.sink.activate())
            .catch_unwind()
            .await
            .unwrap_or(Err(SinkError::Panicked));
        if let Err(source) = activated {
            let err = ConfigError::Activation(source);
            self.report_config(&err);
            self.set_state(&mut core, LifecycleState::Disabled);
            return Err(err);
        }

        let settings = &core.settings;
        if settings.asynchronous {
            settings.queue.register(Delivery {
                consumer: Arc::new(SinkConsumer {
                    sink: Arc::clone(&self.sink),
                    stats: Arc::clone(&self.stats),
                }),
                policy: Arc::new(CountingPolicy {
                    inner: Arc::clone(&settings.policy),
                    stats: Arc::clone(&self.stats),
                }),
                reporter: Arc::clone(&self.reporter),
            });
        }
        let asynchronous = settings.asynchronous;
        self.set_flush_route(Some(if asynchronous {
            FlushRoute::Queue(Arc::clone(&settings.queue))
        } else {
            FlushRoute::Sink
        }));
        self.set_state(&mut core, LifecycleState::Enabled);
        tracing::info!(engine = %self.name, sink = self.sink.name(), asynchronous, "engine activated");
        Ok(())
    }

    async fn configure(
        &self,
        property: &'static str,
        apply: impl FnOnce(&mut Settings),
    ) -> Result<(), ConfigError> {
        let mut core = self.core.lock().await;
        let err = match core.state {
            LifecycleState::Unconfigured => {
                apply(&mut core.settings);
                return Ok(());
            }
            LifecycleState::Closed => ConfigError::Closed,
            _ => ConfigError::Frozen { property },
        };
        self.report_config(&err);
        Err(err)
    }

    pub async fn set_asynchronous(&self, asynchronous: bool) -> Result<(), ConfigError> {
        self.configure("asynchronous", |s| s.asynchronous = asynchronous).await
    }

    pub async fn set_fix(&self, fix: FixFlags) -> Result<(), ConfigError> {
        self.configure("fix", |s| s.fix = fix).await
    }

    pub async fn set_error_policy(&self, policy: Arc<dyn ErrorPolicy>) -> Result<(), ConfigError> {
        self.configure("error_policy", |s| s.policy = policy).await
    }

    /// Replace the queue. A queue already started by an early `dispatch` is disposed.
    pub async fn set_queue(&self, queue: Arc<dyn EventQueue>) -> Result<(), ConfigError> {
        let mut core = self.core.lock().await;
        let err = match core.state {
            LifecycleState::Unconfigured => {
                if core.started {
                    queue.start();
                }
                let previous = std::mem::replace(&mut core.settings.queue, queue);
                previous.dispose().await;
                return Ok(());
            }
            LifecycleState::Closed => ConfigError::Closed,
            _ => ConfigError::Frozen { property: "queue" },
        };
        self.report_config(&err);
        Err(err)
    }

    /// Submit one event.
    pub async fn dispatch(&self, event: impl Into<Payload>) {
        self.dispatch_events(vec![event.into()]).await;
    }

    /// Submit several events; each is filtered on its own and survivors keep their order.
    pub async fn dispatch_all<I>(&self, events: I)
    where
        I: IntoIterator,
        I::Item: Into<Payload>,
    {
        self.dispatch_events(events.into_iter().map(Into::into).collect()).await;
    }

    async fn dispatch_events(&self, events: Vec<Payload>) {
        if events.is_empty() {
            return;
        }
        if reentrancy::is_active(self.id) {
            self.stats.add_recursive_dropped(events.len() as u64);
            tracing::trace!(engine = %self.name, events = events.len(), "nested dispatch dropped");
            return;
        }
        let producer = ProducerContext::capture();

        let mut core = self.core.lock().await;
        if !core.started {
            core.started = true;
            core.settings.queue.start();
        }
        match core.state {
            LifecycleState::Enabled => {}
            LifecycleState::Closed => {
                self.stats.add_closed_appends(1);
                let message = format!(
                    "append to closed engine `{}`; {} events dropped",
                    self.name,
                    events.len()
                );
                self.reporter.report(&message, None);
                return;
            }
            _ => return,
        }

        let settings = &core.settings;
        let formatted = self.run_hooks(settings, &producer, events);
        if formatted.is_empty() {
            return;
        }

        if settings.asynchronous {
            for event in formatted {
                if !settings.queue.enqueue(event) {
                    self.stats.add_overflowed(1);
                    self.reporter.report("queue overflow, event discarded", None);
                }
            }
        } else {
            self.append_now(Batch::new(formatted)).await;
        }
    }

    /// Accept, gate, format and fix. No await point: the re-entrancy section must stay on the
    /// producer's thread.
    fn run_hooks(
        &self,
        settings: &Settings,
        producer: &ProducerContext,
        events: Vec<Payload>,
    ) -> Vec<Payload> {
        let Some(_section) = reentrancy::Section::enter(self.id) else {
            return Vec::new();
        };

        let mut accepted = Vec::with_capacity(events.len());
        for event in events {
            match guarded("accept", || settings.accept.accept(&event)) {
                Ok(true) => accepted.push(event),
                Ok(false) => self.stats.add_filtered(1),
                Err(err) => {
                    self.stats.add_hook_failures(1);
                    self.reporter.report("accept predicate failed; event dropped", Some(&err));
                }
            }
        }
        if accepted.is_empty() {
            return accepted;
        }
        self.stats.add_accepted(accepted.len() as u64);

        match std::panic::catch_unwind(AssertUnwindSafe(|| self.sink.is_ready())) {
            Ok(true) => {}
            Ok(false) => {
                self.stats.add_gate_dropped(accepted.len() as u64);
                tracing::trace!(
                    engine = %self.name,
                    sink = self.sink.name(),
                    events = accepted.len(),
                    "sink not ready; events dropped"
                );
                return Vec::new();
            }
            Err(_) => {
                self.stats.add_gate_dropped(accepted.len() as u64);
                let message = format!(
                    "sink readiness check failed; {} events dropped",
                    accepted.len()
                );
                self.reporter.report(&message, Some(&HookError::Panicked("is_ready")));
                return Vec::new();
            }
        }

        let mut formatted = Vec::with_capacity(accepted.len());
        for event in accepted {
            match guarded("formatter", || settings.formatter.format(event)) {
                Ok(Some(event)) => formatted.push(event),
                Ok(None) => self.stats.add_format_discarded(1),
                Err(err) => {
                    self.stats.add_hook_failures(1);
                    self.reporter.report("formatter failed; event dropped", Some(&err));
                }
            }
        }

        if !settings.asynchronous || settings.fix.is_empty() {
            return formatted;
        }
        let mut fixed = Vec::with_capacity(formatted.len());
        for mut event in formatted {
            let result = guarded("fix", || {
                if let Payload::Record(record) = &mut event {
                    record.fix_from(settings.fix, producer);
                }
                Ok(())
            });
            match result {
                Ok(()) => fixed.push(event),
                Err(err) => {
                    self.stats.add_hook_failures(1);
                    self.reporter.report("fixing event failed; event dropped", Some(&err));
                }
            }
        }
        fixed
    }

    /// Synchronous mode: append under the engine lock. Failures are reported, not retried.
    async fn append_now(&self, batch: Batch) {
        let append = InSection { engine: self.id, inner: self.sink.append(&batch) };
        let result = AssertUnwindSafe(append).catch_unwind().await.unwrap_or(Err(SinkError::Panicked));
        match result {
            Ok(()) => self.stats.add_delivered(batch.len() as u64),
            Err(err) => {
                self.stats.add_failed_attempts(1);
                let message = format!(
                    "sink `{}` failed to append {} events",
                    self.sink.name(),
                    batch.len()
                );
                self.reporter.report(&message, Some(&err));
            }
        }
    }

    /// Wait until buffered events were handed to the sink and the sink flushed, within
    /// `timeout`. Trivially `true` unless the engine is enabled.
    ///
    /// Never waits on the dispatch lock: a producer stuck in a synchronous append cannot stretch
    /// the flush past `timeout`.
    pub async fn flush(&self, timeout: FlushTimeout) -> bool {
        if reentrancy::is_active(self.id) {
            tracing::trace!(engine = %self.name, "flush from inside a hook ignored");
            return false;
        }
        if self.state() != LifecycleState::Enabled {
            return true;
        }
        let route = self.flush_route.read().unwrap_or_else(PoisonError::into_inner).clone();
        match route {
            Some(FlushRoute::Queue(queue)) => queue.flush(timeout).await,
            Some(FlushRoute::Sink) => self.sink.flush(timeout).await,
            None => true,
        }
    }

    /// Stop the queue, then run the sink's teardown. Idempotent.
    pub async fn close(&self) {
        let mut core = self.core.lock().await;
        if core.state == LifecycleState::Closed {
            return;
        }
        self.set_state(&mut core, LifecycleState::Closed);
        self.set_flush_route(None);
        core.settings.queue.dispose().await;
        if AssertUnwindSafe(self.sink.close()).catch_unwind().await.is_err() {
            self.reporter.report(&format!("sink `{}` panicked while closing", self.sink.name()), None);
        }
        tracing::info!(engine = %self.name, "engine closed");
    }
}

#[async_trait]
impl Flushable for DispatchEngine {
    async fn flush(&self, timeout: FlushTimeout) -> bool {
        DispatchEngine::flush(self, timeout).await
    }
}

/// Adapts the engine's sink to the queue's delivery task.
struct SinkConsumer {
    sink: Arc<dyn Sink>,
    stats: Arc<DispatchStats>,
}

#[async_trait]
impl BatchConsumer for SinkConsumer {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        self.sink.append(batch).await?;
        self.stats.add_delivered(batch.len() as u64);
        Ok(())
    }

    async fn on_flushed(&self, remaining: FlushTimeout) -> bool {
        self.sink.flush(remaining).await
    }
}

/// Counts attempts and abandonments on the way to the configured policy.
#[derive(Debug)]
struct CountingPolicy {
    inner: Arc<dyn ErrorPolicy>,
    stats: Arc<DispatchStats>,
}

impl ErrorPolicy for CountingPolicy {
    fn on_failure(&self, attempt: &RetryAttempt<'_>) -> RetryDecision {
        self.stats.add_failed_attempts(1);
        let decision = std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.on_failure(attempt)));
        // a panicking policy abandons the batch in the queue
        if !matches!(decision, Ok(RetryDecision::RetryAfter(_))) {
            self.stats.add_abandoned(attempt.batch.len() as u64);
        }
        decision.unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    }

    fn on_success(&self, batch: &Batch) {
        self.inner.on_success(batch);
    }
}

/// Builder for [`DispatchEngine`].
///
/// Only the sink is required. Without an explicit queue or error policy the builder creates a
/// [`MemoryQueue`] and a [`ConstantRetryPolicy`] from the [`EngineOptions`].
pub struct EngineBuilder {
    options: EngineOptions,
    sink: Option<Arc<dyn Sink>>,
    queue: Option<Arc<dyn EventQueue>>,
    policy: Option<Arc<dyn ErrorPolicy>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    accept: Arc<dyn AcceptPredicate>,
    formatter: Arc<dyn Formatter>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder").field("options", &self.options).finish_non_exhaustive()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            options: EngineOptions::default(),
            sink: None,
            queue: None,
            policy: None,
            reporter: None,
            accept: Arc::new(AcceptAll),
            formatter: Arc::new(IdentityFormatter),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Replace every plain option at once.
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.options.asynchronous = asynchronous;
        self
    }

    pub fn fix(mut self, fix: FixFlags) -> Self {
        self.options.fix = fix;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.options.queue_capacity = capacity;
        self
    }

    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.options.max_batch_size = max;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    /// Delay for the default retry policy; negative disables retries.
    pub fn retry_delay_ms(mut self, millis: i64) -> Self {
        self.options.retry_delay_ms = millis;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.options.max_retries = retries;
        self
    }

    pub fn sink<S: Sink + 'static>(self, sink: S) -> Self {
        self.shared_sink(Arc::new(sink))
    }

    pub fn shared_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn queue<Q: EventQueue + 'static>(mut self, queue: Q) -> Self {
        self.queue = Some(Arc::new(queue));
        self
    }

    pub fn error_policy<P: ErrorPolicy + 'static>(mut self, policy: P) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn reporter<R: ErrorReporter + 'static>(self, reporter: R) -> Self {
        self.shared_reporter(Arc::new(reporter))
    }

    pub fn shared_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn accept<A: AcceptPredicate + 'static>(mut self, accept: A) -> Self {
        self.accept = Arc::new(accept);
        self
    }

    pub fn formatter<F: Formatter + 'static>(mut self, formatter: F) -> Self {
        self.formatter = Arc::new(formatter);
        self
    }

    /// Sleeper for retry delays of the default queue.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Clock for retry timing and flush budgets of the default queue.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<DispatchEngine, ConfigError> {
        let reporter = self.reporter.unwrap_or_else(|| Arc::new(TracingReporter));
        let checked = self.options.validate().and_then(|()| {
            self.sink.ok_or_else(|| ConfigError::invalid("sink", "no sink configured"))
        });
        let sink = match checked {
            Ok(sink) => sink,
            Err(err) => {
                reporter.report("engine could not be built", Some(&err));
                return Err(err);
            }
        };
        let options = self.options;

        let policy = self.policy.unwrap_or_else(|| {
            Arc::new(
                ConstantRetryPolicy::builder()
                    .retry_delay_millis(options.retry_delay_ms)
                    .max_retries(options.max_retries)
                    .reporter(Arc::clone(&reporter))
                    .build(),
            )
        });
        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(
                MemoryQueue::new(options.queue_capacity)
                    .with_max_batch(options.max_batch_size)
                    .with_shutdown_timeout(options.shutdown_timeout)
                    .with_shared_sleeper(self.sleeper)
                    .with_shared_clock(self.clock),
            )
        });

        tracing::debug!(engine = %options.name, sink = sink.name(), "engine built");
        Ok(DispatchEngine {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(options.name.as_str()),
            core: Mutex::new(EngineCore {
                state: LifecycleState::Unconfigured,
                started: false,
                settings: Settings {
                    asynchronous: options.asynchronous,
                    fix: options.fix,
                    queue,
                    policy,
                    accept: self.accept,
                    formatter: self.formatter,
                },
            }),
            state: AtomicU8::new(LifecycleState::Unconfigured as u8),
            flush_route: RwLock::new(None),
            sink,
            reporter,
            stats: Arc::new(DispatchStats::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{TextFormatter, Threshold};
    use crate::record::{Level, LogRecord};
    use crate::report::MemoryReporter;
    use crate::sink::MemorySink;
    use crate::sleeper::InstantSleeper;
    use std::sync::{OnceLock, Weak};

    #[derive(Debug)]
    struct FailingActivation;

    #[async_trait]
    impl Flushable for FailingActivation {
        async fn flush(&self, _timeout: FlushTimeout) -> bool {
            true
        }
    }

    #[async_trait]
    impl Sink for FailingActivation {
        async fn activate(&self) -> Result<(), SinkError> {
            Err(SinkError::rejected("no route to host"))
        }

        async fn append(&self, _batch: &Batch) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn engine(sink: &MemorySink, reporter: &MemoryReporter, asynchronous: bool) -> DispatchEngine {
        DispatchEngine::builder()
            .name("test")
            .asynchronous(asynchronous)
            .sink(sink.clone())
            .reporter(reporter.clone())
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap()
    }

    fn info(message: &str) -> LogRecord {
        LogRecord::new(Level::Info, "test", message)
    }

    #[tokio::test]
    async fn build_requires_a_sink() {
        let reporter = MemoryReporter::new();
        let err = DispatchEngine::builder().reporter(reporter.clone()).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sink", .. }));
        assert_eq!(reporter.len(), 1);
    }

    #[tokio::test]
    async fn activation_moves_to_enabled() {
        let sink = MemorySink::new();
        let engine = engine(&sink, &MemoryReporter::new(), true);
        assert_eq!(engine.state(), LifecycleState::Unconfigured);
        engine.activate().await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Enabled);
    }

    #[tokio::test]
    async fn second_activation_disables_the_engine() {
        let sink = MemorySink::new();
        let reporter = MemoryReporter::new();
        let engine = engine(&sink, &reporter, false);
        engine.activate().await.unwrap();

        let err = engine.activate().await.unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyActivated));
        assert_eq!(engine.state(), LifecycleState::Disabled);
        assert_eq!(reporter.count_containing("configuration error"), 1);

        engine.dispatch(info("ignored")).await;
        assert!(sink.is_empty());
        assert!(engine.flush(FlushTimeout::ZERO).await);
    }

    #[tokio::test]
    async fn failed_sink_activation_leaves_engine_inert() {
        let reporter = MemoryReporter::new();
        let engine = DispatchEngine::builder()
            .sink(FailingActivation)
            .reporter(reporter.clone())
            .build()
            .unwrap();

        let err = engine.activate().await.unwrap_err();
        assert!(matches!(err, ConfigError::Activation(_)));
        assert_eq!(engine.state(), LifecycleState::Disabled);

        engine.dispatch(info("dropped")).await;
        assert_eq!(engine.stats().accepted, 0);
    }

    #[tokio::test]
    async fn dispatch_before_activation_is_silent() {
        let sink = MemorySink::new();
        let reporter = MemoryReporter::new();
        let engine = engine(&sink, &reporter, true);
        engine.dispatch(info("early")).await;
        assert!(reporter.is_empty());
        assert_eq!(engine.stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn setters_work_before_activation_only() {
        let sink = MemorySink::new();
        let reporter = MemoryReporter::new();
        let engine = engine(&sink, &reporter, true);

        engine.set_asynchronous(false).await.unwrap();
        engine.activate().await.unwrap();

        let err = engine.set_asynchronous(true).await.unwrap_err();
        assert!(matches!(err, ConfigError::Frozen { property: "asynchronous" }));
        let err = engine.set_fix(FixFlags::NONE).await.unwrap_err();
        assert!(matches!(err, ConfigError::Frozen { property: "fix" }));

        // still synchronous: delivered without a flush
        engine.dispatch(info("direct")).await;
        assert_eq!(sink.messages(), vec!["direct"]);
    }

    #[tokio::test]
    async fn filtered_and_discarded_events_never_reach_the_sink() {
        let sink = MemorySink::new();
        let engine = DispatchEngine::builder()
            .asynchronous(false)
            .sink(sink.clone())
            .accept(Threshold(Level::Info))
            .formatter(|event: Payload| -> Result<Option<Payload>, HookError> {
                let secret = event.as_record().map_or(false, |r| r.message().contains("secret"));
                Ok(if secret { None } else { Some(event) })
            })
            .build()
            .unwrap();
        engine.activate().await.unwrap();

        engine
            .dispatch_all(vec![
                LogRecord::new(Level::Debug, "test", "too quiet"),
                info("keep 1"),
                info("secret token"),
                info("keep 2"),
            ])
            .await;

        assert_eq!(sink.messages(), vec!["keep 1", "keep 2"]);
        let stats = engine.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.format_discarded, 1);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test]
    async fn panicking_formatter_is_reported_not_propagated() {
        let sink = MemorySink::new();
        let reporter = MemoryReporter::new();
        let engine = DispatchEngine::builder()
            .asynchronous(false)
            .sink(sink.clone())
            .reporter(reporter.clone())
            .formatter(|_event: Payload| -> Result<Option<Payload>, HookError> {
                panic!("layout bug")
            })
            .build()
            .unwrap();
        engine.activate().await.unwrap();

        engine.dispatch(info("boom")).await;

        assert!(sink.is_empty());
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error.as_deref(), Some("formatter hook panicked"));
    }

    #[tokio::test]
    async fn panicking_deferred_message_drops_only_that_event() {
        let sink = MemorySink::new();
        let reporter = MemoryReporter::new();
        let engine = engine(&sink, &reporter, true);
        engine.activate().await.unwrap();

        engine
            .dispatch_all(vec![
                LogRecord::deferred(Level::Info, "test", || -> String { panic!("render bug") }),
                info("kept"),
            ])
            .await;
        assert!(engine.flush(FlushTimeout::from_millis(1_000)).await);

        assert_eq!(sink.messages(), vec!["kept"]);
        assert_eq!(engine.stats().hook_failures, 1);
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error.as_deref(), Some("fix hook panicked"));
        engine.close().await;
    }

    #[tokio::test]
    async fn panicking_readiness_gate_is_reported_not_propagated() {
        #[derive(Debug)]
        struct GateBug;

        #[async_trait]
        impl Flushable for GateBug {
            async fn flush(&self, _timeout: FlushTimeout) -> bool {
                true
            }
        }

        #[async_trait]
        impl Sink for GateBug {
            fn is_ready(&self) -> bool {
                panic!("gate bug")
            }

            async fn append(&self, _batch: &Batch) -> Result<(), SinkError> {
                Ok(())
            }
        }

        let reporter = MemoryReporter::new();
        let engine = DispatchEngine::builder()
            .asynchronous(false)
            .sink(GateBug)
            .reporter(reporter.clone())
            .build()
            .unwrap();
        engine.activate().await.unwrap();

        engine.dispatch_all(vec![info("one"), info("two")]).await;

        assert_eq!(reporter.count_containing("sink readiness check failed; 2 events dropped"), 1);
        let stats = engine.stats();
        assert_eq!(stats.gate_dropped, 2);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn nested_dispatch_from_formatter_is_dropped() {
        let sink = MemorySink::new();
        let slot: Arc<OnceLock<Weak<DispatchEngine>>> = Arc::new(OnceLock::new());
        let hook_slot = Arc::clone(&slot);
        let engine = Arc::new(
            DispatchEngine::builder()
                .asynchronous(false)
                .sink(sink.clone())
                .formatter(move |event: Payload| -> Result<Option<Payload>, HookError> {
                    if let Some(engine) = hook_slot.get().and_then(Weak::upgrade) {
                        futures::executor::block_on(engine.dispatch(info("from formatter")));
                    }
                    Ok(Some(event))
                })
                .build()
                .unwrap(),
        );
        slot.set(Arc::downgrade(&engine)).unwrap();
        engine.activate().await.unwrap();

        engine.dispatch(info("outer")).await;

        assert_eq!(sink.messages(), vec!["outer"]);
        assert_eq!(engine.stats().recursive_dropped, 1);
    }

    #[tokio::test]
    async fn text_formatter_output_is_queued_as_bytes() {
        let sink = MemorySink::new();
        let engine = DispatchEngine::builder()
            .sink(sink.clone())
            .formatter(TextFormatter::new())
            .build()
            .unwrap();
        engine.activate().await.unwrap();

        engine.dispatch(info("hello")).await;
        assert!(engine.flush(FlushTimeout::from_millis(1_000)).await);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_record());
        assert!(sink.messages()[0].ends_with("test - hello"));
        engine.close().await;
    }

    #[tokio::test]
    async fn queued_records_are_fixed_on_the_producer() {
        let sink = MemorySink::new();
        let engine = DispatchEngine::builder().sink(sink.clone()).build().unwrap();
        engine.activate().await.unwrap();

        engine.dispatch(info("fixed")).await;
        assert!(engine.flush(FlushTimeout::from_millis(1_000)).await);

        let events = sink.events();
        let record = events[0].as_record().unwrap();
        assert_eq!(record.fixed(), FixFlags::ALL);
        engine.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_later_appends_are_reported() {
        let sink = MemorySink::new();
        let reporter = MemoryReporter::new();
        let engine = engine(&sink, &reporter, true);
        engine.activate().await.unwrap();

        engine.close().await;
        engine.close().await;
        assert_eq!(engine.state(), LifecycleState::Closed);

        engine.dispatch(info("late")).await;
        engine.dispatch(info("later")).await;
        assert_eq!(reporter.count_containing("append to closed engine"), 2);
        assert_eq!(engine.stats().closed_appends, 2);
        assert!(sink.is_empty());

        assert!(matches!(engine.activate().await, Err(ConfigError::Closed)));
        assert_eq!(engine.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn set_queue_replaces_the_default_queue() {
        let sink = MemorySink::new();
        let engine = engine(&sink, &MemoryReporter::new(), true);
        engine.set_queue(Arc::new(MemoryQueue::new(7))).await.unwrap();
        engine.activate().await.unwrap();

        assert_eq!(engine.queue_length().await, Some(0));
        let err = engine.set_queue(Arc::new(MemoryQueue::new(1))).await.unwrap_err();
        assert!(matches!(err, ConfigError::Frozen { property: "queue" }));
    }
}
