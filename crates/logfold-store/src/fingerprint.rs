//! Event fingerprints
//!
//! A fingerprint identifies "the same" event across processes and restarts.
//! It is a name-based UUID (v5) over `canonical(message) + level_name`.
//! Logger name, source location and time are deliberately left out.
//!
//! Canonical form: a string message is used verbatim. Any other value is
//! rendered as compact JSON, and `serde_json` keeps object keys sorted, so
//! two maps with the same entries always canonicalize identically.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::Level;

/// Fixed namespace for all fingerprints
pub const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x8296424f_28b7_5982_a434_e6ec8ef529b3);

/// Deterministic 128-bit identity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(Uuid);

impl Fingerprint {
    /// Fingerprint a message at a level
    pub fn compute(message: &Value, level: Level) -> Self {
        let mut key = canonical_message(message);
        key.push_str(level.name());
        Self(Uuid::new_v5(&FINGERPRINT_NAMESPACE, key.as_bytes()))
    }

    /// 32 lowercase hex digits, the form used as the document key
    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// Reduce a message to the string that is hashed
pub fn canonical_message(message: &Value) -> String {
    match message {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for Fingerprint {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| StoreError::serialization(format!("invalid fingerprint '{s}': {e}")))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
