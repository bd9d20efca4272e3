//! Raw log events handed to the store
//!
//! An [`Event`] is never persisted as-is. The record builder turns it into a
//! [`LogDocument`](crate::document::LogDocument).

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Name of the sentinel level given to the store's own activity
pub const INTERNAL_LEVEL_NAME: &str = "LOGFOLD-INTERNAL";

/// Severity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    /// Sentinel for the store's own activity; never fingerprinted or stored
    #[serde(rename = "LOGFOLD-INTERNAL")]
    Internal,
}

impl Level {
    /// Upper-case name as it appears in documents
    pub fn name(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
            Level::Internal => INTERNAL_LEVEL_NAME,
        }
    }

    /// Numeric severity (Python logging scale)
    pub fn num(&self) -> u8 {
        match self {
            Level::Trace => 5,
            Level::Debug => 10,
            Level::Info => 20,
            Level::Warning => 30,
            Level::Error => 40,
            Level::Critical => 50,
            Level::Internal => 0,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Level {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Level::Trace),
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" | "FATAL" => Ok(Level::Critical),
            INTERNAL_LEVEL_NAME => Ok(Level::Internal),
            other => Err(StoreError::configuration(format!("unknown level '{other}'"))),
        }
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warning,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Thread that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub num: u64,
    pub name: String,
}

impl ThreadInfo {
    /// Identity of the calling thread
    pub fn current() -> Self {
        static NEXT_THREAD_NUM: AtomicU64 = AtomicU64::new(1);
        thread_local! {
            static THREAD_NUM: Cell<u64> = const { Cell::new(0) };
        }

        let num = THREAD_NUM.with(|cell| {
            if cell.get() == 0 {
                cell.set(NEXT_THREAD_NUM.fetch_add(1, Ordering::Relaxed));
            }
            cell.get()
        });
        let current = std::thread::current();
        let name = current.name().unwrap_or("unnamed").to_string();
        Self { num, name }
    }
}

/// Process that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub num: u32,
    pub name: String,
}

impl ProcessInfo {
    /// Identity of the running process
    pub fn current() -> Self {
        let name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "main".to_string());
        Self {
            num: std::process::id(),
            name,
        }
    }
}

/// Where in the source an event was raised
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Full path of the source file
    pub path: String,
    /// Module path
    pub module: String,
    /// Enclosing function, when known
    pub function: String,
    pub line: u32,
    /// Final component of `path`
    pub filename: String,
}

impl SourceLocation {
    /// Build a location from a file path and line
    pub fn new(path: impl Into<String>, module: impl Into<String>, line: u32) -> Self {
        let path = path.into();
        let filename = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        Self {
            path,
            module: module.into(),
            function: String::new(),
            line,
            filename,
        }
    }

    /// Set the enclosing function
    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }
}

/// Error attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Error type name
    pub kind: String,
    /// Rendered error message
    pub message: String,
    /// Backtrace or cause chain, one line per entry
    pub trace: Vec<String>,
    /// Structured error payload, if any
    pub payload: Option<Value>,
}

impl ExceptionInfo {
    /// Capture an error and its `source()` chain
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let kind = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        let mut trace = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            kind,
            message: err.to_string(),
            trace,
            payload: None,
        }
    }

    /// Build from preformatted trace text
    pub fn from_text(kind: impl Into<String>, message: impl Into<String>, text: &str) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: text.trim_end_matches('\n').lines().map(str::to_string).collect(),
            payload: None,
        }
    }

    /// Attach a structured payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A single log occurrence as produced by the application
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub level: Level,
    /// Scalar or arbitrarily nested message
    pub message: Value,
    /// Logger (or tracing target) name
    pub logger: String,
    /// When the event was raised
    pub timestamp: DateTime<Utc>,
    pub thread: ThreadInfo,
    pub process: ProcessInfo,
    pub location: SourceLocation,
    pub exception: Option<ExceptionInfo>,
}

impl Event {
    /// Create an event stamped with the current time, thread and process
    pub fn new(level: Level, message: impl Into<Value>) -> Self {
        Self {
            level,
            message: message.into(),
            logger: "root".to_string(),
            timestamp: Utc::now(),
            thread: ThreadInfo::current(),
            process: ProcessInfo::current(),
            location: SourceLocation::default(),
            exception: None,
        }
    }

    /// Create an event whose message is any serializable value
    ///
    /// Fails with a serialization error if the value has no JSON form,
    /// for example a map with non-string keys.
    pub fn with_payload<T: Serialize + ?Sized>(
        level: Level,
        payload: &T,
    ) -> Result<Self, StoreError> {
        let message = serde_json::to_value(payload)?;
        Ok(Self::new(level, message))
    }

    /// Set the logger name
    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = logger.into();
        self
    }

    /// Set the event time
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the source location
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    /// Attach error information
    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }
}
