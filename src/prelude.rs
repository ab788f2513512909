//! Convenient re-exports for common spool types.
pub use crate::{
    config::EngineOptions,
    context::ThreadContext,
    engine::{DispatchEngine, EngineBuilder, LifecycleState},
    error::{ConfigError, HookError, SinkError},
    flush::{FlushCoordinator, FlushTimeout, Flushable},
    hooks::{
        AcceptAll, AcceptPredicate, DenyTarget, Filter, FilterChain, FilterDecision, Formatter,
        IdentityFormatter, TextFormatter, Threshold,
    },
    policy::{ConstantRetryPolicy, ErrorPolicy, RetryAttempt, RetryDecision},
    queue::{Batch, EventQueue, MemoryQueue},
    record::{FixFlags, Level, LogRecord, Payload},
    report::{ErrorReporter, MemoryReporter, OnceReporter, TracingReporter},
    sink::{FanoutSink, MemorySink, NullSink, Sink, TracingSink},
    stats::StatsSnapshot,
};
