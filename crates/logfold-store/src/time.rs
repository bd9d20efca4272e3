//! Occurrence timestamps
//!
//! Timestamps are stored as RFC 3339 strings with microsecond precision and
//! an explicit offset, so documents written in `local` and `utc` mode stay
//! comparable once parsed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;

/// Which clock offset new timestamps are rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeZoneMode {
    /// Host local time (default)
    #[default]
    Local,
    /// Coordinated universal time
    Utc,
}

impl FromStr for TimeZoneMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "utc" => Ok(Self::Utc),
            other => Err(StoreError::configuration(format!(
                "time_zone must be one of [local, utc], got '{other}'"
            ))),
        }
    }
}

/// A point in time attached to a log occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<FixedOffset>);

impl Timestamp {
    /// Current time in the given mode
    pub fn now(mode: TimeZoneMode) -> Self {
        Self::from_utc(Utc::now(), mode)
    }

    /// Render a UTC instant in the given mode
    pub fn from_utc(instant: DateTime<Utc>, mode: TimeZoneMode) -> Self {
        match mode {
            TimeZoneMode::Utc => Self(instant.fixed_offset()),
            TimeZoneMode::Local => Self(instant.with_timezone(&Local).fixed_offset()),
        }
    }

    /// Parse an RFC 3339 string
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        DateTime::parse_from_rfc3339(s)
            .map(Self)
            .map_err(|e| StoreError::serialization(format!("invalid timestamp '{s}': {e}")))
    }

    /// The underlying instant
    pub fn as_datetime(&self) -> DateTime<FixedOffset> {
        self.0
    }

    /// Microseconds since the Unix epoch
    pub fn timestamp_micros(&self) -> i64 {
        self.0.timestamp_micros()
    }

    /// RFC 3339 form used inside documents
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        Self(instant.fixed_offset())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(&raw).map_err(serde::de::Error::custom)
    }
}
