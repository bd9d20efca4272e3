//! Event to document conversion
//!
//! The builder fingerprints the raw message, sanitizes its keys under the
//! rules picked at connect time and lays the metadata out in the configured
//! shape. Events that belong to the store itself come back as
//! [`BuiltRecord::Internal`] and are never fingerprinted.

use serde_json::{Map, Value, json};

use crate::config::{RecordShape, StoreConfig, StrategyKind};
use crate::document::{History, LogDocument};
use crate::error::StoreError;
use crate::event::{Event, ExceptionInfo, Level};
use crate::fingerprint::Fingerprint;
use crate::sanitize::KeySanitizer;
use crate::time::{TimeZoneMode, Timestamp};

/// Result of building an event
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltRecord {
    /// A document ready for the storage engine
    Document(LogDocument),
    /// The store's own activity, tagged with the sentinel level
    Internal { logger: String },
}

impl BuiltRecord {
    pub fn level_name(&self) -> &str {
        match self {
            BuiltRecord::Document(doc) => doc.level_name().unwrap_or_default(),
            BuiltRecord::Internal { .. } => Level::Internal.name(),
        }
    }

    pub fn into_document(self) -> Option<LogDocument> {
        match self {
            BuiltRecord::Document(doc) => Some(doc),
            BuiltRecord::Internal { .. } => None,
        }
    }
}

/// Converts events into storable documents
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    shape: RecordShape,
    strategy: StrategyKind,
    time_zone: TimeZoneMode,
    sanitizer: KeySanitizer,
    internal_targets: Vec<String>,
    max_document_bytes: usize,
}

impl RecordBuilder {
    pub fn new(shape: RecordShape, strategy: StrategyKind, sanitizer: KeySanitizer) -> Self {
        Self {
            shape,
            strategy,
            time_zone: TimeZoneMode::default(),
            sanitizer,
            internal_targets: Vec::new(),
            max_document_bytes: crate::config::DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }

    /// Builder for a validated configuration and the connection's key rules
    pub fn from_config(config: &StoreConfig, sanitizer: KeySanitizer) -> Self {
        Self {
            shape: config.shape,
            strategy: config.strategy,
            time_zone: config.time_zone,
            sanitizer,
            internal_targets: config.internal_targets.clone(),
            max_document_bytes: config.max_document_bytes,
        }
    }

    pub fn with_time_zone(mut self, time_zone: TimeZoneMode) -> Self {
        self.time_zone = time_zone;
        self
    }

    pub fn with_internal_targets(mut self, targets: Vec<String>) -> Self {
        self.internal_targets = targets;
        self
    }

    pub fn with_max_document_bytes(mut self, max: usize) -> Self {
        self.max_document_bytes = max;
        self
    }

    pub fn sanitizer(&self) -> &KeySanitizer {
        &self.sanitizer
    }

    /// Whether a logger name belongs to the store's own activity
    ///
    /// A target matches itself and anything nested under it (`a::b`, `a.b`).
    pub fn is_internal(&self, logger: &str) -> bool {
        self.internal_targets.iter().any(|target| {
            logger.strip_prefix(target.as_str()).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with("::") || rest.starts_with('.')
            })
        })
    }

    /// Build the document for one occurrence of an event
    pub fn build(&self, event: &Event) -> Result<BuiltRecord, StoreError> {
        if event.level == Level::Internal || self.is_internal(&event.logger) {
            return Ok(BuiltRecord::Internal {
                logger: event.logger.clone(),
            });
        }

        let fingerprint = Fingerprint::compute(&event.message, event.level);
        let occurred_at = Timestamp::from_utc(event.timestamp, self.time_zone);
        let msg = self.sanitizer.sanitize(&event.message);

        let mut fields = match self.shape {
            RecordShape::Simple => self.simple_fields(event, msg),
            RecordShape::Verbose => self.verbose_fields(event, msg),
        };
        if let Some(exception) = &event.exception {
            fields.insert("exception".to_string(), self.exception_field(exception));
        }

        let history = match self.strategy {
            StrategyKind::Embedded => History::Embedded {
                created: occurred_at,
                counter: 1,
                dates: vec![occurred_at],
            },
            StrategyKind::Reference => History::Reference { time: occurred_at },
        };

        let document = LogDocument {
            fingerprint,
            fields,
            history,
        };
        self.check_size(&document)?;
        Ok(BuiltRecord::Document(document))
    }

    fn simple_fields(&self, event: &Event, msg: Value) -> Map<String, Value> {
        let location = &event.location;
        let mut fields = Map::new();
        fields.insert("name".into(), json!(event.logger));
        fields.insert("thread".into(), json!(event.thread.num));
        fields.insert("process".into(), json!(event.process.num));
        fields.insert("level".into(), json!(event.level.name()));
        fields.insert("msg".into(), msg);
        fields.insert("path".into(), json!(location.path));
        fields.insert("module".into(), json!(location.module));
        fields.insert("line".into(), json!(location.line));
        fields.insert("func".into(), json!(location.function));
        fields.insert("filename".into(), json!(location.filename));
        fields
    }

    fn verbose_fields(&self, event: &Event, msg: Value) -> Map<String, Value> {
        let location = &event.location;
        let mut fields = Map::new();
        fields.insert("name".into(), json!(event.logger));
        fields.insert(
            "thread".into(),
            json!({"num": event.thread.num, "name": event.thread.name}),
        );
        fields.insert(
            "process".into(),
            json!({"num": event.process.num, "name": event.process.name}),
        );
        fields.insert(
            "level".into(),
            json!({"name": event.level.name(), "num": event.level.num()}),
        );
        fields.insert(
            "info".into(),
            json!({
                "msg": msg,
                "path": location.path,
                "module": location.module,
                "line": location.line,
                "func": location.function,
                "filename": location.filename,
            }),
        );
        fields
    }

    fn exception_field(&self, exception: &ExceptionInfo) -> Value {
        let mut info = Map::new();
        info.insert("type".into(), json!(exception.kind));
        info.insert("message".into(), json!(exception.message));
        if let Some(payload) = &exception.payload {
            info.insert("payload".into(), self.sanitizer.sanitize(payload));
        }
        json!({
            "info": Value::Object(info),
            "trace": exception.trace,
        })
    }

    fn check_size(&self, document: &LogDocument) -> Result<(), StoreError> {
        let size = serde_json::to_vec(&document.to_json())?.len();
        if size > self.max_document_bytes {
            return Err(StoreError::serialization(format!(
                "document for {} is {size} bytes, limit is {}",
                document.fingerprint, self.max_document_bytes
            )));
        }
        Ok(())
    }
}
