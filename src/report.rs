//! Diagnostic sinks for failures the engine handles internally.
//!
//! Every failure inside the dispatch, queue and retry path ends up in an [`ErrorReporter`]
//! instead of propagating to the producer. Reporters are fire-and-forget and must never panic.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Receives internally handled failures.
pub trait ErrorReporter: Send + Sync + fmt::Debug {
    fn report(&self, message: &str, error: Option<&(dyn StdError + 'static)>);
}

/// Forwards reports to `tracing` at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        match error {
            Some(err) => tracing::error!(error = %err, "{message}"),
            None => tracing::error!("{message}"),
        }
    }
}

/// One captured report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub message: String,
    pub error: Option<String>,
}

/// Keeps reports in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
    reports: Arc<Mutex<Vec<Report>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of reports whose message contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.reports
            .lock()
            .map(|r| r.iter().filter(|report| report.message.contains(needle)).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorReporter for MemoryReporter {
    fn report(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(Report {
                message: message.to_string(),
                error: error.map(ToString::to_string),
            });
        }
    }
}

/// Forwards only the first report; later ones are counted and dropped.
///
/// Keeps a persistently failing sink from flooding the diagnostic channel.
#[derive(Debug)]
pub struct OnceReporter<R> {
    inner: R,
    fired: AtomicBool,
    suppressed: AtomicU64,
}

impl<R: ErrorReporter> OnceReporter<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, fired: AtomicBool::new(false), suppressed: AtomicU64::new(0) }
    }

    /// Reports dropped after the first one.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Allow the next report through again.
    pub fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }
}

impl<R: ErrorReporter> ErrorReporter for OnceReporter<R> {
    fn report(&self, message: &str, error: Option<&(dyn StdError + 'static)>) {
        if self.fired.swap(true, Ordering::AcqRel) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.inner.report(message, error);
    }
}
