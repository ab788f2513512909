//! Events accepted by the engine.
//!
//! A producer hands the engine a [`Payload`]: either a raw [`LogRecord`], whose volatile fields
//! are only valid on the producing thread, or an already encoded value that is safe to move to
//! any thread. Raw records cross into the queue only after [`LogRecord::fix`] has snapshotted
//! the fields selected by [`FixFlags`].

use crate::context::{Properties, ThreadContext};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::panic::Location;
use std::str::FromStr;
use std::sync::Arc;

/// Severity of a record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which volatile fields of a [`LogRecord`] to snapshot before it leaves the producing thread.
///
/// Snapshotting is not free (rendering messages, copying properties), so engines may opt for a
/// partial fix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(try_from = "String"))]
pub struct FixFlags(u8);

impl FixFlags {
    pub const NONE: FixFlags = FixFlags(0);
    /// Render a deferred message.
    pub const MESSAGE: FixFlags = FixFlags(1);
    /// Capture the producing thread's name.
    pub const THREAD_NAME: FixFlags = FixFlags(1 << 1);
    /// Copy the producing thread's [`ThreadContext`] properties.
    pub const PROPERTIES: FixFlags = FixFlags(1 << 2);
    /// Render the attached error chain to text.
    pub const ERROR: FixFlags = FixFlags(1 << 3);
    pub const PARTIAL: FixFlags = FixFlags(Self::MESSAGE.0 | Self::THREAD_NAME.0 | Self::ERROR.0);
    pub const ALL: FixFlags = FixFlags(Self::PARTIAL.0 | Self::PROPERTIES.0);

    const NAMED: [(&'static str, FixFlags); 4] = [
        ("message", Self::MESSAGE),
        ("thread_name", Self::THREAD_NAME),
        ("properties", Self::PROPERTIES),
        ("error", Self::ERROR),
    ];

    pub fn contains(self, other: FixFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for FixFlags {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for FixFlags {
    type Output = FixFlags;

    fn bitor(self, rhs: FixFlags) -> FixFlags {
        FixFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FixFlags {
    fn bitor_assign(&mut self, rhs: FixFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FixFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> =
            Self::NAMED.iter().filter(|(_, flag)| self.contains(*flag)).map(|(n, _)| *n).collect();
        write!(f, "FixFlags({})", names.join(" | "))
    }
}

/// Error returned when parsing an unknown fix flag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fix flag: {0}")]
pub struct ParseFixFlagsError(pub String);

impl FromStr for FixFlags {
    type Err = ParseFixFlagsError;

    /// Accepts `all`, `partial`, `none`, or a comma separated list of flag names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => return Ok(Self::ALL),
            "partial" => return Ok(Self::PARTIAL),
            "none" | "" => return Ok(Self::NONE),
            _ => {}
        }
        let mut flags = Self::NONE;
        for part in s.split(',') {
            let part = part.trim().to_ascii_lowercase();
            let flag = Self::NAMED
                .iter()
                .find(|(name, _)| *name == part)
                .map(|(_, flag)| *flag)
                .ok_or_else(|| ParseFixFlagsError(part.clone()))?;
            flags |= flag;
        }
        Ok(flags)
    }
}

impl TryFrom<String> for FixFlags {
    type Error = ParseFixFlagsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Record message, either rendered or rendered on demand.
#[derive(Clone)]
pub enum Message {
    Rendered(String),
    Deferred(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Message {
    pub fn render(&self) -> String {
        match self {
            Message::Rendered(text) => text.clone(),
            Message::Deferred(render) => render(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Rendered(text) => f.debug_tuple("Rendered").field(text).finish(),
            Message::Deferred(_) => f.write_str("Deferred(<closure>)"),
        }
    }
}

/// A raw log record as created by a producer.
#[derive(Debug, Clone)]
pub struct LogRecord {
    level: Level,
    target: String,
    message: Message,
    timestamp: DateTime<Utc>,
    location: &'static Location<'static>,
    error: Option<Arc<dyn std::error::Error + Send + Sync>>,
    thread_name: Option<String>,
    properties: Option<Properties>,
    error_text: Option<String>,
    fixed: FixFlags,
}

impl LogRecord {
    /// Create a record stamped with the current time and the caller's location.
    #[track_caller]
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_message(level, target, Message::Rendered(message.into()))
    }

    /// Create a record whose message is rendered only when needed.
    #[track_caller]
    pub fn deferred<F>(level: Level, target: impl Into<String>, render: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self::with_message(level, target, Message::Deferred(Arc::new(render)))
    }

    #[track_caller]
    fn with_message(level: Level, target: impl Into<String>, message: Message) -> Self {
        Self {
            level,
            target: target.into(),
            message,
            timestamp: Utc::now(),
            location: Location::caller(),
            error: None,
            thread_name: None,
            properties: None,
            error_text: None,
            fixed: FixFlags::NONE,
        }
    }

    /// Attach an error to the record.
    pub fn with_error<E>(mut self, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(error));
        self.error_text = None;
        self
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// The message text, rendering it now if it was deferred and not yet fixed.
    pub fn message(&self) -> String {
        self.message.render()
    }

    /// Name of the producing thread once fixed; otherwise the current thread's name.
    pub fn thread_name(&self) -> Option<String> {
        match &self.thread_name {
            Some(name) => Some(name.clone()),
            None => current_thread_name(),
        }
    }

    /// Properties captured at fix time; otherwise the current thread's properties.
    pub fn properties(&self) -> Properties {
        match &self.properties {
            Some(props) => props.clone(),
            None => ThreadContext::snapshot(),
        }
    }

    /// The attached error rendered with its source chain.
    pub fn error_text(&self) -> Option<String> {
        if let Some(text) = &self.error_text {
            return Some(text.clone());
        }
        self.error.as_deref().map(|e| render_error_chain(e))
    }

    /// Flags that have been fixed so far.
    pub fn fixed(&self) -> FixFlags {
        self.fixed
    }

    /// Snapshot the selected volatile fields from the calling thread.
    ///
    /// Fields that are already fixed keep their first snapshot.
    pub fn fix(&mut self, flags: FixFlags) {
        self.fix_from(flags, &ProducerContext::capture());
    }

    /// Like [`fix`](Self::fix), with thread-bound values captured earlier on the producer.
    pub(crate) fn fix_from(&mut self, flags: FixFlags, producer: &ProducerContext) {
        if flags.contains(FixFlags::MESSAGE) && !self.fixed.contains(FixFlags::MESSAGE) {
            if let Message::Deferred(render) = &self.message {
                self.message = Message::Rendered(render());
            }
        }
        if flags.contains(FixFlags::THREAD_NAME) && !self.fixed.contains(FixFlags::THREAD_NAME) {
            self.thread_name = Some(producer.thread_name.clone().unwrap_or_default());
        }
        if flags.contains(FixFlags::PROPERTIES) && !self.fixed.contains(FixFlags::PROPERTIES) {
            self.properties = Some(producer.properties.clone());
        }
        if flags.contains(FixFlags::ERROR) && !self.fixed.contains(FixFlags::ERROR) {
            self.error_text = self.error.as_deref().map(|e| render_error_chain(e));
        }
        self.fixed |= flags;
    }
}

/// Thread-bound values of the producing thread.
///
/// The engine captures this before awaiting its lock: a task may resume on another worker
/// thread afterwards, and fixing must still see the producer's values.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProducerContext {
    thread_name: Option<String>,
    properties: Properties,
}

impl ProducerContext {
    pub(crate) fn capture() -> Self {
        Self { thread_name: current_thread_name(), properties: ThreadContext::snapshot() }
    }
}

fn current_thread_name() -> Option<String> {
    std::thread::current().name().map(str::to_owned)
}

fn render_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// One event as it travels through the engine.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A raw record; volatile fields may still need fixing.
    Record(LogRecord),
    /// An encoded, immutable representation safe to hand to any thread.
    Encoded(Bytes),
}

impl Payload {
    pub fn as_record(&self) -> Option<&LogRecord> {
        match self {
            Payload::Record(record) => Some(record),
            Payload::Encoded(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Encoded(bytes) => Some(bytes),
            Payload::Record(_) => None,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Payload::Record(_))
    }
}

impl From<LogRecord> for Payload {
    fn from(record: LogRecord) -> Self {
        Payload::Record(record)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Encoded(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Encoded(Bytes::from(text))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Encoded(Bytes::from_static(text.as_bytes()))
    }
}
