#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # spool
//!
//! Asynchronous dispatch of log events to slow or unreliable sinks.
//!
//! ## Features
//!
//! - **Ordered dispatch**: filtering, formatting and enqueueing run under one lock per engine
//! - **Bounded queue** that never blocks producers and reports overflow instead
//! - **Batch retry** with a pluggable error policy (constant delay by default)
//! - **Bounded flush** across the queue and any number of downstream sinks
//! - **Re-entrancy guard** so logging from inside the logging path cannot recurse
//!
//! ## Quick Start
//!
//! ```rust
//! use spool::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ConfigError> {
//!     let sink = MemorySink::new();
//!     let engine = DispatchEngine::builder()
//!         .sink(sink.clone())
//!         .queue_capacity(256)
//!         .retry_delay_ms(50)
//!         .max_retries(2)
//!         .build()?;
//!     engine.activate().await?;
//!
//!     engine.dispatch(LogRecord::new(Level::Warn, "app", "disk almost full")).await;
//!     engine.flush(FlushTimeout::from_millis(500)).await;
//!     engine.close().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod flush;
pub mod hooks;
pub mod policy;
pub mod prelude;
pub mod queue;
pub mod record;
pub mod report;
pub mod sink;
pub mod sleeper;
pub mod stats;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::EngineOptions;
pub use context::ThreadContext;
pub use engine::{DispatchEngine, EngineBuilder, LifecycleState};
pub use error::{BoxError, ConfigError, HookError, SinkError};
pub use flush::{FlushCoordinator, FlushTimeout, Flushable};
pub use hooks::{AcceptPredicate, Formatter};
pub use policy::{ConstantRetryPolicy, ErrorPolicy, RetryAttempt, RetryDecision};
pub use queue::{Batch, BatchConsumer, Delivery, EventQueue, MemoryQueue};
pub use record::{FixFlags, Level, LogRecord, Payload};
pub use report::{ErrorReporter, TracingReporter};
pub use sink::Sink;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stats::StatsSnapshot;
