//! Pluggable accept and format hooks.
//!
//! Hooks run synchronously on the producer's task while the engine lock is held, so they see
//! events in dispatch order and may keep non-thread-safe state behind a plain mutex. A hook that
//! logs through the engine it is attached to gets its nested event dropped.

use crate::error::HookError;
use crate::record::{Level, LogRecord, Payload};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Decides whether an event is accepted at all.
pub trait AcceptPredicate: Send + Sync {
    fn accept(&self, event: &Payload) -> Result<bool, HookError>;
}

impl<F> AcceptPredicate for F
where
    F: Fn(&Payload) -> Result<bool, HookError> + Send + Sync,
{
    fn accept(&self, event: &Payload) -> Result<bool, HookError> {
        self(event)
    }
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AcceptPredicate for AcceptAll {
    fn accept(&self, _event: &Payload) -> Result<bool, HookError> {
        Ok(true)
    }
}

/// Accepts records at or above a level. Encoded payloads carry no level and always pass.
#[derive(Debug, Clone, Copy)]
pub struct Threshold(pub Level);

impl AcceptPredicate for Threshold {
    fn accept(&self, event: &Payload) -> Result<bool, HookError> {
        Ok(event.as_record().map_or(true, |r| r.level() >= self.0))
    }
}

/// Outcome of one filter in a [`FilterChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Deny,
    /// Defer to the next filter.
    Neutral,
}

/// One link of a [`FilterChain`].
pub trait Filter: Send + Sync {
    fn decide(&self, event: &Payload) -> Result<FilterDecision, HookError>;
}

/// Optional threshold followed by ordered filters.
///
/// The first non-neutral decision wins; if every filter is neutral the event is accepted.
#[derive(Clone, Default)]
pub struct FilterChain {
    threshold: Option<Level>,
    filters: Vec<Arc<dyn Filter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("threshold", &self.threshold)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threshold(mut self, level: Level) -> Self {
        self.threshold = Some(level);
        self
    }

    pub fn filter<F: Filter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }
}

impl AcceptPredicate for FilterChain {
    fn accept(&self, event: &Payload) -> Result<bool, HookError> {
        if let Some(threshold) = self.threshold {
            if !Threshold(threshold).accept(event)? {
                return Ok(false);
            }
        }
        for filter in &self.filters {
            match filter.decide(event)? {
                FilterDecision::Accept => return Ok(true),
                FilterDecision::Deny => return Ok(false),
                FilterDecision::Neutral => {}
            }
        }
        Ok(true)
    }
}

/// Denies records whose target starts with a prefix; neutral otherwise.
#[derive(Debug, Clone)]
pub struct DenyTarget(pub String);

impl Filter for DenyTarget {
    fn decide(&self, event: &Payload) -> Result<FilterDecision, HookError> {
        Ok(match event.as_record() {
            Some(record) if record.target().starts_with(&self.0) => FilterDecision::Deny,
            _ => FilterDecision::Neutral,
        })
    }
}

/// Turns an accepted event into the representation handed to the sink.
///
/// `Ok(None)` discards the event.
pub trait Formatter: Send + Sync {
    fn format(&self, event: Payload) -> Result<Option<Payload>, HookError>;
}

impl<F> Formatter for F
where
    F: Fn(Payload) -> Result<Option<Payload>, HookError> + Send + Sync,
{
    fn format(&self, event: Payload) -> Result<Option<Payload>, HookError> {
        self(event)
    }
}

/// Passes events through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityFormatter;

impl Formatter for IdentityFormatter {
    fn format(&self, event: Payload) -> Result<Option<Payload>, HookError> {
        Ok(Some(event))
    }
}

/// Renders records into one line of text:
/// `2026-01-02T03:04:05.678Z INFO [main] app::db - connected`.
///
/// Encoded payloads pass through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormatter {
    with_properties: bool,
}

impl TextFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `{key=value, ...}` when the record carries properties.
    pub fn with_properties(mut self) -> Self {
        self.with_properties = true;
        self
    }

    pub fn render(&self, record: &LogRecord) -> String {
        let mut line = format!(
            "{} {} [{}] {} - {}",
            record.timestamp().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level(),
            record.thread_name().unwrap_or_default(),
            record.target(),
            record.message(),
        );
        if self.with_properties {
            let props = record.properties();
            if !props.is_empty() {
                let joined: Vec<String> = props.iter().map(|(k, v)| format!("{k}={v}")).collect();
                line.push_str(&format!(" {{{}}}", joined.join(", ")));
            }
        }
        if let Some(error) = record.error_text() {
            line.push_str(" | ");
            line.push_str(&error);
        }
        line
    }
}

impl Formatter for TextFormatter {
    fn format(&self, event: Payload) -> Result<Option<Payload>, HookError> {
        match event {
            Payload::Record(record) => Ok(Some(Payload::Encoded(Bytes::from(self.render(&record))))),
            encoded @ Payload::Encoded(_) => Ok(Some(encoded)),
        }
    }
}
