//! Injected logging for the netplay engine.
//!
//! Every component reports through a [`LogSink`] handed to the session in
//! [`SessionConfig`](crate::SessionConfig). There is no process-wide logger:
//! two sessions in one process can log to different places, and tests can
//! capture exactly what one session reported.
//!
//! # Levels
//!
//! | Level | Used for |
//! |-------|----------|
//! | [`LogLevel::Error`] | Socket failures, ring-window breaches |
//! | [`LogLevel::Warning`] | Undecodable datagrams, handshake timeouts |
//! | [`LogLevel::Debug`] | Per-packet protocol traffic, stale frames |
//! | [`LogLevel::Message`] | Lifecycle events and desync reports |
//!
//! # Example
//!
//! ```
//! use shobu_rollback::telemetry::{CollectingSink, Component, LogLevel, LogSink, LogRecord};
//!
//! let sink = CollectingSink::new();
//! sink.log(&LogRecord::new(LogLevel::Message, Component::Session, "hello", "lib.rs:1"));
//! assert_eq!(sink.records_at(LogLevel::Message).len(), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Severity of a log record, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// A failure that ends a connection or indicates a broken invariant.
    Error,
    /// Something unexpected that the engine recovered from.
    Warning,
    /// High-volume protocol detail.
    Debug,
    /// Noteworthy events meant for the player or operator.
    Message,
}

impl LogLevel {
    /// Returns the level as a lowercase string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Debug => "debug",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The part of the engine a record originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Handshake and connect/disconnect lifecycle.
    Connection,
    /// The background receive loop.
    Listener,
    /// The rollback state machine.
    Engine,
    /// Packet encoding and decoding.
    Codec,
    /// The loss and latency simulator.
    Simulator,
    /// The session facade.
    Session,
}

impl Component {
    /// Returns the component as a lowercase string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Listener => "listener",
            Self::Engine => "engine",
            Self::Codec => "codec",
            Self::Simulator => "simulator",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single leveled message reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Reporting component.
    pub component: Component,
    /// Human-readable text.
    pub message: String,
    /// Source location (`file:line`) of the call site.
    pub location: &'static str,
}

impl LogRecord {
    /// Creates a new record.
    pub fn new(
        level: LogLevel,
        component: Component,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            level,
            component,
            message: message.into(),
            location,
        }
    }

    /// Serializes this record to a compact JSON string.
    ///
    /// Only available with the `json` feature.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {})",
            self.level, self.component, self.message, self.location
        )
    }
}

/// Destination for engine log records.
///
/// Sinks are shared between the simulation thread and the listener thread,
/// so implementations must be `Send + Sync` and should return quickly.
pub trait LogSink: Send + Sync {
    /// Receives one record.
    fn log(&self, record: &LogRecord);

    /// Returns `false` if records at `level` would be discarded.
    ///
    /// The [`netlog!`](crate::netlog) macro skips formatting entirely when
    /// this returns `false`.
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }
}

/// Default sink that forwards records to `tracing`.
///
/// `Error` maps to `tracing::error!`, `Warning` to `warn!`, `Debug` to
/// `debug!` and `Message` to `info!`. The component and call-site location
/// are attached as structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, record: &LogRecord) {
        let component = record.component.as_str();
        let location = record.location;
        match record.level {
            LogLevel::Error => {
                tracing::error!(component, location, "{}", record.message);
            },
            LogLevel::Warning => {
                tracing::warn!(component, location, "{}", record.message);
            },
            LogLevel::Debug => {
                tracing::debug!(component, location, "{}", record.message);
            },
            LogLevel::Message => {
                tracing::info!(component, location, "{}", record.message);
            },
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _record: &LogRecord) {}

    fn enabled(&self, _level: LogLevel) -> bool {
        false
    }
}

/// Sink that stores records in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of every record received so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Returns the records at exactly `level`.
    #[must_use]
    pub fn records_at(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Returns `true` if any record's message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.records.lock().iter().any(|r| r.message.contains(needle))
    }

    /// Number of records received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Discards all stored records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for CollectingSink {
    fn log(&self, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Sink that forwards every record to several other sinks.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl CompositeSink {
    /// Creates a composite with no children.
    #[must_use]
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Adds a child sink.
    pub fn add(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    /// Builds a composite from a list of sinks.
    #[must_use]
    pub fn from_sinks(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

impl LogSink for CompositeSink {
    fn log(&self, record: &LogRecord) {
        for sink in &self.sinks {
            if sink.enabled(record.level) {
                sink.log(record);
            }
        }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        self.sinks.iter().any(|s| s.enabled(level))
    }
}

impl fmt::Debug for CompositeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeSink")
            .field("num_sinks", &self.sinks.len())
            .finish()
    }
}

/// Reports a formatted record to a sink, capturing the call site.
///
/// Formatting is skipped when the sink reports the level as disabled.
///
/// ```
/// use shobu_rollback::netlog;
/// use shobu_rollback::telemetry::{CollectingSink, Component, LogLevel};
///
/// let sink = CollectingSink::new();
/// netlog!(sink, LogLevel::Debug, Component::Engine, "stalled at tick {}", 12);
/// assert!(sink.contains("stalled at tick 12"));
/// ```
#[macro_export]
macro_rules! netlog {
    ($sink:expr, $level:expr, $component:expr, $msg:literal) => {{
        #[allow(unused_imports)]
        use $crate::telemetry::LogSink as _;
        let level = $level;
        if $sink.enabled(level) {
            $sink.log(&$crate::telemetry::LogRecord::new(
                level,
                $component,
                $msg,
                concat!(file!(), ":", line!()),
            ));
        }
    }};
    ($sink:expr, $level:expr, $component:expr, $fmt:literal, $($arg:tt)+) => {{
        #[allow(unused_imports)]
        use $crate::telemetry::LogSink as _;
        let level = $level;
        if $sink.enabled(level) {
            $sink.log(&$crate::telemetry::LogRecord::new(
                level,
                $component,
                format!($fmt, $($arg)+),
                concat!(file!(), ":", line!()),
            ));
        }
    }};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Message);
    }

    #[test]
    fn netlog_accepts_shared_and_borrowed_sinks() {
        let collecting = Arc::new(CollectingSink::new());
        let shared: Arc<dyn LogSink> = collecting.clone();
        let borrowed: &dyn LogSink = &*shared;
        netlog!(shared, LogLevel::Warning, Component::Session, "from arc");
        netlog!(borrowed, LogLevel::Error, Component::Codec, "from ref {}", 2);
        assert!(collecting.contains("from arc"));
        assert!(collecting.contains("from ref 2"));
        assert_eq!(collecting.records_at(LogLevel::Error).len(), 1);
    }

    #[test]
    fn collecting_sink_filters_by_level() {
        let sink = CollectingSink::new();
        netlog!(sink, LogLevel::Error, Component::Listener, "socket error");
        netlog!(sink, LogLevel::Debug, Component::Engine, "tick {}", 3);
        netlog!(sink, LogLevel::Debug, Component::Engine, "tick {}", 4);

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.records_at(LogLevel::Error).len(), 1);
        assert_eq!(sink.records_at(LogLevel::Debug).len(), 2);
        assert!(sink.contains("tick 4"));

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn netlog_captures_call_site() {
        let sink = CollectingSink::new();
        netlog!(sink, LogLevel::Message, Component::Session, "started");
        let record = &sink.records()[0];
        assert!(record.location.contains("telemetry.rs"));
        assert_eq!(record.component, Component::Session);
    }

    #[test]
    fn null_sink_skips_formatting() {
        struct Loud;
        impl fmt::Display for Loud {
            fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
                panic!("formatted a disabled record");
            }
        }
        let sink = NullSink;
        netlog!(sink, LogLevel::Error, Component::Codec, "{}", Loud);
    }

    #[test]
    fn composite_fans_out() {
        let a = Arc::new(CollectingSink::new());
        let b = Arc::new(CollectingSink::new());
        let composite = CompositeSink::from_sinks(vec![a.clone(), b.clone(), Arc::new(NullSink)]);
        netlog!(composite, LogLevel::Warning, Component::Simulator, "dropped");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn display_includes_level_and_component() {
        let record = LogRecord::new(LogLevel::Warning, Component::Codec, "bad tag", "x.rs:1");
        assert_eq!(record.to_string(), "[warning/codec] bad tag (at x.rs:1)");
    }

    #[cfg(feature = "json")]
    #[test]
    fn record_serializes_to_json() {
        let record = LogRecord::new(LogLevel::Debug, Component::Listener, "old tick", "x.rs:2");
        let json = record.to_json().unwrap();
        assert!(json.contains(r#""level":"debug""#));
        assert!(json.contains(r#""component":"listener""#));
    }
}
