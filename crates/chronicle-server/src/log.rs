//! Request log records and the sinks that receive them.
//!
//! A [`Log`] is handed to every component that writes request records. It
//! wraps one [`LogSink`]: [`TracingSink`] in the binary, [`MemorySink`] in
//! tests and [`NullSink`] when no logging is wanted. Callers never check
//! whether logging is enabled; the null sink simply drops every record.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value};

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        })
    }
}

/// Named payload of a record.
///
/// Values that cannot be rendered as JSON are dropped instead of failing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Map<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing any previous value under `key`.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.0.insert(key.to_owned(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    fn extend_missing(&mut self, bound: &Fields) {
        for (key, value) in &bound.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// One structured event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub msg: String,
    pub fields: Fields,
}

impl LogRecord {
    /// Shorthand for `self.fields.get(key)`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Destination for [`LogRecord`]s.
pub trait LogSink: Send + Sync {
    fn write(&self, record: LogRecord);
}

/// Sink that discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write(&self, _record: LogRecord) {}
}

/// Sink that forwards records to `tracing`.
///
/// The record's fields are rendered as a single JSON value in the `fields`
/// attribute so that nested request/response summaries survive intact.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, record: LogRecord) {
        let fields = record.fields.into_value();
        let msg = record.msg;
        match record.level {
            Level::Debug => tracing::debug!(target: "chronicle_server::request", %fields, "{msg}"),
            Level::Info => tracing::info!(target: "chronicle_server::request", %fields, "{msg}"),
            Level::Warn => tracing::warn!(target: "chronicle_server::request", %fields, "{msg}"),
            Level::Error => tracing::error!(target: "chronicle_server::request", %fields, "{msg}"),
        }
    }
}

/// Bounded in-memory sink keeping the most recent records.
#[derive(Debug)]
pub struct MemorySink {
    limit: usize,
    records: Mutex<VecDeque<LogRecord>>,
}

impl MemorySink {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new() -> Self {
        Self::with_limit(Self::DEFAULT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of the retained records, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemorySink {
    fn write(&self, record: LogRecord) {
        let mut records = self.lock();
        if records.len() == self.limit {
            records.pop_front();
        }
        records.push_back(record);
    }
}

/// Cheaply clonable handle used to emit records.
#[derive(Clone)]
pub struct Log {
    sink: Arc<dyn LogSink>,
    bound: Arc<Fields>,
}

impl Log {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            bound: Arc::new(Fields::new()),
        }
    }

    /// A handle whose records go nowhere.
    pub fn none() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Derive a handle that adds `key` to every record it writes.
    ///
    /// Fields passed at the call site win over bound ones.
    pub fn child(&self, key: &str, value: impl Serialize) -> Self {
        let bound = (*self.bound).clone().with(key, value);
        Self {
            sink: Arc::clone(&self.sink),
            bound: Arc::new(bound),
        }
    }

    pub fn log(&self, level: Level, mut fields: Fields, msg: &str) {
        fields.extend_missing(&self.bound);
        self.sink.write(LogRecord {
            level,
            msg: msg.to_owned(),
            fields,
        });
    }

    pub fn debug(&self, fields: Fields, msg: &str) {
        self.log(Level::Debug, fields, msg);
    }

    pub fn info(&self, fields: Fields, msg: &str) {
        self.log(Level::Info, fields, msg);
    }

    pub fn warn(&self, fields: Fields, msg: &str) {
        self.log(Level::Warn, fields, msg);
    }

    pub fn error(&self, fields: Fields, msg: &str) {
        self.log(Level::Error, fields, msg);
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log").field("bound", &self.bound).finish_non_exhaustive()
    }
}
