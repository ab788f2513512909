//! Error types for sinks, hooks and engine configuration.
//!
//! None of these ever reach a producer's `dispatch` call site. Sink and hook errors are routed
//! to the configured [`ErrorReporter`](crate::report::ErrorReporter); configuration errors are
//! both reported and returned to the configuring code.

use std::error::Error as StdError;

/// Boxed error used for opaque collaborator failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure raised by a [`Sink`](crate::sink::Sink) while handling a batch.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The transport failed with an I/O error.
    #[error("sink i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport refused the batch.
    #[error("sink rejected batch: {0}")]
    Rejected(String),
    /// The sink panicked while appending.
    #[error("sink panicked while appending")]
    Panicked,
    /// Some downstream targets of a fan-out failed.
    #[error("{failed} of {total} downstream sinks failed")]
    Fanout { failed: usize, total: usize },
    /// Any other transport failure.
    #[error(transparent)]
    Other(BoxError),
}

impl SinkError {
    /// Convenience constructor for a rejection with a message.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Wrap an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Box::new(err))
    }
}

/// Invalid lifecycle transitions and option values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `activate` was called after activation had already started.
    #[error("activate called more than once")]
    AlreadyActivated,
    /// A property was changed after activation.
    #[error("cannot change `{property}` after activation")]
    Frozen { property: &'static str },
    /// The engine is closed; no transition leaves this state.
    #[error("engine is closed")]
    Closed,
    /// An option value failed validation.
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    /// The sink's activation hook failed; the engine stays disabled.
    #[error("activation failed: {0}")]
    Activation(#[source] SinkError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// Failure raised by a filter or formatter hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The hook returned an error.
    #[error(transparent)]
    Failed(BoxError),
    /// The hook panicked.
    #[error("{0} hook panicked")]
    Panicked(&'static str),
}

impl HookError {
    /// Wrap an arbitrary error.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Failed(err.into())
    }
}
