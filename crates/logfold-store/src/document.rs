//! Persisted document shapes
//!
//! A [`LogDocument`] is the unit stored in the primary container, one per
//! fingerprint. Shape-specific content (simple or verbose) lives in an open
//! field map. The occurrence history is typed: either the embedded
//! `created`/`counter`/`dates` triple or the reference `time` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::time::Timestamp;

pub const FINGERPRINT_FIELD: &str = "fingerprint";
pub const CREATED_FIELD: &str = "created";
pub const COUNTER_FIELD: &str = "counter";
pub const DATES_FIELD: &str = "dates";
pub const TIME_FIELD: &str = "time";

const HISTORY_FIELDS: [&str; 4] = [CREATED_FIELD, COUNTER_FIELD, DATES_FIELD, TIME_FIELD];

/// How repeats of a fingerprint are recorded on the document itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum History {
    /// Capped rolling history plus an uncapped total
    Embedded {
        /// First time the fingerprint was seen
        created: Timestamp,
        /// Occurrences since creation
        counter: u64,
        /// Most recent occurrence times, oldest first
        dates: Vec<Timestamp>,
    },
    /// Latest occurrence only; the full history is in the ledger
    Reference {
        time: Timestamp,
    },
}

/// One logical log record
#[derive(Debug, Clone, PartialEq)]
pub struct LogDocument {
    pub fingerprint: Fingerprint,
    /// Shape-specific fields (name, level, msg or info, thread, ...)
    pub fields: Map<String, Value>,
    pub history: History,
}

impl LogDocument {
    /// Encode as the JSON object stored by backends
    pub fn to_json(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert(
            FINGERPRINT_FIELD.to_string(),
            Value::String(self.fingerprint.to_hex()),
        );
        match &self.history {
            History::Embedded {
                created,
                counter,
                dates,
            } => {
                map.insert(CREATED_FIELD.to_string(), Value::String(created.to_rfc3339()));
                map.insert(COUNTER_FIELD.to_string(), Value::from(*counter));
                map.insert(
                    DATES_FIELD.to_string(),
                    Value::Array(
                        dates
                            .iter()
                            .map(|d| Value::String(d.to_rfc3339()))
                            .collect(),
                    ),
                );
            }
            History::Reference { time } => {
                map.insert(TIME_FIELD.to_string(), Value::String(time.to_rfc3339()));
            }
        }
        Value::Object(map)
    }

    /// Decode a stored JSON object
    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let map = value
            .as_object()
            .ok_or_else(|| StoreError::serialization("document is not an object"))?;

        let fingerprint = map
            .get(FINGERPRINT_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::serialization("document has no fingerprint"))?
            .parse::<Fingerprint>()?;

        let history = if let Some(counter) = map.get(COUNTER_FIELD) {
            let counter = counter
                .as_u64()
                .ok_or_else(|| StoreError::serialization("counter is not an unsigned integer"))?;
            let created = timestamp_field(map, CREATED_FIELD)?;
            let dates = match map.get(DATES_FIELD) {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .ok_or_else(|| StoreError::serialization("date is not a string"))
                            .and_then(Timestamp::parse)
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => Vec::new(),
            };
            History::Embedded {
                created,
                counter,
                dates,
            }
        } else {
            History::Reference {
                time: timestamp_field(map, TIME_FIELD)?,
            }
        };

        let fields = map
            .iter()
            .filter(|(k, _)| {
                k.as_str() != FINGERPRINT_FIELD && !HISTORY_FIELDS.contains(&k.as_str())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            fingerprint,
            fields,
            history,
        })
    }

    /// First time this fingerprint was recorded
    ///
    /// Reference documents only know their latest occurrence.
    pub fn first_seen(&self) -> Timestamp {
        match &self.history {
            History::Embedded { created, .. } => *created,
            History::Reference { time } => *time,
        }
    }

    /// Most recent recorded occurrence
    pub fn last_seen(&self) -> Timestamp {
        match &self.history {
            History::Embedded { created, dates, .. } => dates.last().copied().unwrap_or(*created),
            History::Reference { time } => *time,
        }
    }

    /// Occurrence counter (embedded documents only)
    pub fn counter(&self) -> Option<u64> {
        match &self.history {
            History::Embedded { counter, .. } => Some(*counter),
            History::Reference { .. } => None,
        }
    }

    /// Rolling occurrence history (embedded documents only)
    pub fn dates(&self) -> &[Timestamp] {
        match &self.history {
            History::Embedded { dates, .. } => dates,
            History::Reference { .. } => &[],
        }
    }

    /// Level name for either shape
    pub fn level_name(&self) -> Option<&str> {
        level_name_of(&self.fields)
    }

    /// Logger name
    pub fn logger_name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    /// Message payload for either shape
    pub fn message(&self) -> Option<&Value> {
        self.fields
            .get("msg")
            .or_else(|| self.fields.get("info").and_then(|info| info.get("msg")))
    }
}

/// Level name of a document map: `level` (simple) or `level.name` (verbose)
pub(crate) fn level_name_of(map: &Map<String, Value>) -> Option<&str> {
    match map.get("level") {
        Some(Value::String(name)) => Some(name),
        Some(Value::Object(level)) => level.get("name").and_then(Value::as_str),
        _ => None,
    }
}

fn timestamp_field(map: &Map<String, Value>, field: &str) -> Result<Timestamp, StoreError> {
    map.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::serialization(format!("document has no '{field}' timestamp")))
        .and_then(Timestamp::parse)
}

/// One row of the timestamp ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub fingerprint: Fingerprint,
    pub occurred_at: Timestamp,
}

/// Increment-and-cap applied to an existing embedded document
///
/// Backends run [`EmbeddedUpdate::apply`] inside their per-document atomic
/// section, so concurrent writers never lose an increment.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedUpdate {
    pub occurred_at: Timestamp,
    /// Length cap on `dates`
    pub max_keep: usize,
    /// Also cap `counter` at `max_keep`
    pub cap_counter: bool,
}

impl EmbeddedUpdate {
    /// Bump the counter and push onto the bounded history, oldest evicted first
    pub fn apply(&self, doc: &mut Map<String, Value>) -> Result<(), StoreError> {
        let counter = doc
            .get(COUNTER_FIELD)
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::storage("existing document has no embedded counter"))?;
        let mut next = counter.saturating_add(1);
        if self.cap_counter {
            next = next.min(self.max_keep as u64);
        }
        doc.insert(COUNTER_FIELD.to_string(), Value::from(next));

        let dates = doc
            .entry(DATES_FIELD)
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(dates) = dates else {
            return Err(StoreError::storage("existing document has a non-array 'dates'"));
        };
        dates.push(Value::String(self.occurred_at.to_rfc3339()));
        if dates.len() > self.max_keep {
            let excess = dates.len() - self.max_keep;
            dates.drain(..excess);
        }
        Ok(())
    }
}
