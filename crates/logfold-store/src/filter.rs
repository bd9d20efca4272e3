//! Read-path filters, projections and ordering
//!
//! Filters address nested fields with dotted paths (`info.msg.test`). As in
//! the usual document-store semantics, a path that crosses an array matches
//! when any element matches, and an array field equals a value when it
//! contains it.

use serde_json::{Map, Value};

use crate::document::{
    COUNTER_FIELD, CREATED_FIELD, DATES_FIELD, FINGERPRINT_FIELD, TIME_FIELD, level_name_of,
};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::time::Timestamp;

/// Predicate over stored documents; every set criterion must hold
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub fingerprint: Option<Fingerprint>,
    /// Level name, either shape
    pub level: Option<String>,
    /// Logger name
    pub logger: Option<String>,
    /// Dotted-path equality constraints
    pub equals: Vec<(String, Value)>,
    /// First-seen time at or before this instant
    pub first_seen_before: Option<Timestamp>,
}

impl Filter {
    /// Matches everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse an equality filter from a JSON object of `path: value` pairs
    pub fn from_json(query: &Value) -> Result<Self, StoreError> {
        let map = query
            .as_object()
            .ok_or_else(|| StoreError::configuration("query filter must be a JSON object"))?;
        Ok(Self {
            equals: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ..Self::default()
        })
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    pub fn with_equals(mut self, path: impl Into<String>, value: Value) -> Self {
        self.equals.push((path.into(), value));
        self
    }

    pub fn with_first_seen_before(mut self, cutoff: Timestamp) -> Self {
        self.first_seen_before = Some(cutoff);
        self
    }

    /// Evaluate against a stored JSON document
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(map) = doc.as_object() else {
            return false;
        };

        if let Some(fp) = &self.fingerprint {
            if map.get(FINGERPRINT_FIELD).and_then(Value::as_str) != Some(fp.to_hex().as_str()) {
                return false;
            }
        }
        if let Some(level) = &self.level {
            match level_name_of(map) {
                Some(name) if name.eq_ignore_ascii_case(level) => {}
                _ => return false,
            }
        }
        if let Some(logger) = &self.logger {
            if map.get("name").and_then(Value::as_str) != Some(logger.as_str()) {
                return false;
            }
        }
        if let Some(cutoff) = &self.first_seen_before {
            match first_seen_of(map) {
                Some(seen) if seen <= *cutoff => {}
                _ => return false,
            }
        }
        self.equals.iter().all(|(path, expected)| {
            let segments: Vec<&str> = path.split('.').collect();
            path_matches(doc, &segments, expected)
        })
    }
}

fn path_matches(value: &Value, segments: &[&str], expected: &Value) -> bool {
    match segments.split_first() {
        None => {
            value == expected
                || matches!(value, Value::Array(items) if items.contains(expected))
        }
        Some((head, rest)) => match value {
            Value::Object(map) => map
                .get(*head)
                .is_some_and(|child| path_matches(child, rest, expected)),
            Value::Array(items) => {
                if let Ok(index) = head.parse::<usize>() {
                    if let Some(item) = items.get(index) {
                        if path_matches(item, rest, expected) {
                            return true;
                        }
                    }
                }
                items.iter().any(|item| path_matches(item, segments, expected))
            }
            _ => false,
        },
    }
}

/// `created` for embedded documents, `time` for reference documents
pub fn first_seen_of(map: &Map<String, Value>) -> Option<Timestamp> {
    map.get(CREATED_FIELD)
        .or_else(|| map.get(TIME_FIELD))
        .and_then(Value::as_str)
        .and_then(|s| Timestamp::parse(s).ok())
}

/// Sort newest first by first-seen time
pub fn sort_newest_first(docs: &mut [Value]) {
    docs.sort_by(|a, b| {
        let ka = a.as_object().and_then(first_seen_of);
        let kb = b.as_object().and_then(first_seen_of);
        kb.cmp(&ka)
    });
}

/// Keep only the listed dotted paths, plus the identity and history fields
pub fn project(doc: &Value, fields: &[String]) -> Value {
    let Some(src) = doc.as_object() else {
        return doc.clone();
    };
    let mut out = Map::new();
    for keep in [FINGERPRINT_FIELD, CREATED_FIELD, COUNTER_FIELD, DATES_FIELD, TIME_FIELD] {
        if let Some(v) = src.get(keep) {
            out.insert(keep.to_string(), v.clone());
        }
    }
    for path in fields {
        let segments: Vec<&str> = path.split('.').collect();
        copy_path(src, &mut out, &segments);
    }
    Value::Object(out)
}

fn copy_path(src: &Map<String, Value>, dst: &mut Map<String, Value>, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = src.get(*head) else {
        return;
    };
    if rest.is_empty() {
        dst.insert(head.to_string(), value.clone());
        return;
    }
    if let Value::Object(child_src) = value {
        let child_dst = dst
            .entry(head.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(child_dst) = child_dst {
            copy_path(child_src, child_dst, rest);
        }
    }
}

/// Filter, projection and cap for [`LogStore::find`](crate::LogStore::find)
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filter: Filter,
    /// Dotted paths to keep; `None` returns whole documents
    pub projection: Option<Vec<String>>,
    /// Maximum number of documents returned
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn with_projection(mut self, fields: Vec<String>) -> Self {
        self.projection = Some(fields);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
