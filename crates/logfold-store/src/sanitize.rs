//! Key sanitization for the document model
//!
//! Older document-model versions reject `.` anywhere in a key and `$` in any
//! key position. From 3.6 on, only a leading `$` is reserved. The rule set is
//! picked once, from the version the backend reports at connect time, and
//! stays fixed for the lifetime of the connection.
//!
//! Reserved characters are replaced by their full-width lookalikes
//! (`.` -> U+FF0E, `$` -> U+FF04). [`restore_key`] reverses the substitution,
//! which is exact as long as the original keys did not already contain those
//! full-width characters.
//!
//! A rewritten key can land on a key that was already stored in its
//! full-width form. The untouched key keeps the name and the rewritten one
//! gets a `#2`, `#3`, ... suffix, so no value is dropped.

use std::borrow::Cow;

use serde_json::{Map, Value};

use crate::backend::ServerVersion;

const FULLWIDTH_DOT: char = '\u{FF0E}';
const FULLWIDTH_DOLLAR: char = '\u{FF04}';
const COLLISION_SEPARATOR: char = '#';

/// Escaping policy for document keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRules {
    /// Every `.` and every `$` is replaced
    Legacy,
    /// Only a leading `$` is replaced
    Modern,
}

impl KeyRules {
    /// Pick the rules a backend version requires
    pub fn for_version(version: &ServerVersion) -> Self {
        if version >= &ServerVersion::new(3, 6) {
            KeyRules::Modern
        } else {
            KeyRules::Legacy
        }
    }
}

/// Rewrites map keys the backend would reject
#[derive(Debug, Clone, Copy)]
pub struct KeySanitizer {
    rules: KeyRules,
}

impl KeySanitizer {
    pub fn new(rules: KeyRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> KeyRules {
        self.rules
    }

    /// Rewrite a single key
    pub fn sanitize_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
        match self.rules {
            KeyRules::Legacy => {
                if key.contains(['.', '$']) {
                    Cow::Owned(
                        key.chars()
                            .map(|c| match c {
                                '.' => FULLWIDTH_DOT,
                                '$' => FULLWIDTH_DOLLAR,
                                other => other,
                            })
                            .collect(),
                    )
                } else {
                    Cow::Borrowed(key)
                }
            }
            KeyRules::Modern => match key.strip_prefix('$') {
                Some(rest) => Cow::Owned(format!("{FULLWIDTH_DOLLAR}{rest}")),
                None => Cow::Borrowed(key),
            },
        }
    }

    /// Sanitize every key of a value at any depth
    ///
    /// Objects nested inside arrays are visited too. The input is left
    /// untouched and a rewritten copy is returned.
    pub fn sanitize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.sanitize_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            scalar => scalar.clone(),
        }
    }

    /// Sanitize the keys of a map at any depth
    pub fn sanitize_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        let mut rewritten = Vec::new();
        for (key, value) in map {
            match self.sanitize_key(key) {
                Cow::Borrowed(_) => {
                    out.insert(key.clone(), self.sanitize(value));
                }
                Cow::Owned(new_key) => rewritten.push((new_key, value)),
            }
        }
        for (key, value) in rewritten {
            let key = free_key(&out, key);
            out.insert(key, self.sanitize(value));
        }
        out
    }
}

fn free_key(map: &Map<String, Value>, key: String) -> String {
    if !map.contains_key(&key) {
        return key;
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{key}{COLLISION_SEPARATOR}{n}");
        if !map.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Undo the full-width substitution on a key
pub fn restore_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            FULLWIDTH_DOT => '.',
            FULLWIDTH_DOLLAR => '$',
            other => other,
        })
        .collect()
}

/// Undo the full-width substitution on every key of a value
pub fn restore(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (restore_key(k), restore(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(restore).collect()),
        scalar => scalar.clone(),
    }
}
