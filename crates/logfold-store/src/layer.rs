//! `tracing` front-end for the store
//!
//! [`StoreLayer`] turns `tracing` events into [`Event`]s and emits them into an
//! injected [`LogStore`]. Events from the store's own targets are tagged
//! internal by the record builder and skipped. A thread-local guard also stops
//! any event raised while an emit is in progress from re-entering the store.
//!
//! Emit failures are never swallowed: they go to the failure hook (stderr by
//! default) and are counted.
//!
//! `tracing` metadata carries no function name, so the record's `func` is the
//! name of the span the event was raised in (an `#[instrument]`ed function
//! names its span after itself), and empty outside any span.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::error::StoreError;
use crate::event::{Event, Level, SourceLocation};
use crate::store::LogStore;

thread_local! {
    static IN_EMIT: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as emitting; cleared on drop, unwinding included
struct EmitGuard;

impl EmitGuard {
    fn enter() -> Option<Self> {
        IN_EMIT.with(|flag| (!flag.replace(true)).then_some(EmitGuard))
    }
}

impl Drop for EmitGuard {
    fn drop(&mut self) {
        IN_EMIT.with(|flag| flag.set(false));
    }
}

type FailureHook = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Layer that persists every `tracing` event through a [`LogStore`]
pub struct StoreLayer {
    store: Arc<LogStore>,
    on_failure: FailureHook,
    failures: AtomicU64,
}

impl fmt::Debug for StoreLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLayer")
            .field("failures", &self.failures())
            .finish()
    }
}

impl StoreLayer {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self {
            store,
            on_failure: Arc::new(|e: &StoreError| {
                eprintln!("logfold: failed to store log event: {e}")
            }),
            failures: AtomicU64::new(0),
        }
    }

    /// Replace the failure hook
    pub fn with_failure_hook(
        mut self,
        hook: impl Fn(&StoreError) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Arc::new(hook);
        self
    }

    /// Number of events that failed to store
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Convert a `tracing` event; the function name is left empty
    pub fn convert(event: &tracing::Event<'_>) -> Event {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let location = SourceLocation::new(
            metadata.file().unwrap_or_default(),
            metadata.module_path().unwrap_or_default(),
            metadata.line().unwrap_or_default(),
        );

        Event::new(Level::from(*metadata.level()), visitor.into_message())
            .with_logger(metadata.target())
            .with_location(location)
    }

    fn emit(&self, event: Event) {
        if let Err(e) = self.store.emit(&event) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            (self.on_failure)(&e);
        }
    }
}

impl<S> Layer<S> for StoreLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(_guard) = EmitGuard::enter() else {
            return;
        };
        let mut converted = Self::convert(event);
        if let Some(span) = ctx.event_span(event) {
            converted.location.function = span.name().to_string();
        }
        self.emit(converted);
    }
}

/// Collects the `message` field and any structured fields
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    /// A bare message stays a string; structured fields make it an object
    fn into_message(self) -> Value {
        let message = self.message.unwrap_or_default();
        if self.fields.is_empty() {
            return Value::String(message);
        }
        let mut map = self.fields;
        map.insert("message".to_string(), Value::String(message));
        Value::Object(map)
    }

    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::from(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }
}
