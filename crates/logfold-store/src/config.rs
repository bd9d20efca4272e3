//! Configuration for the log store
//!
//! A [`StoreConfig`] can be built in code, parsed from TOML, or read from
//! `LOGFOLD_*` environment variables. Every path ends in
//! [`StoreConfig::validate`]; the store never starts with a configuration that
//! fails it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{ServerVersion, WriteConcern};
use crate::error::StoreError;
use crate::time::TimeZoneMode;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "LOGFOLD_";

/// Default cap on the embedded occurrence history
pub const DEFAULT_MAX_KEEP: usize = 25;

/// Default upper bound on a stored document
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

macro_rules! config_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        } default $default:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::configuration(format!(
                        concat!("invalid ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

config_enum! {
    /// Layout of the stored document
    RecordShape {
        /// Event metadata flattened into top-level fields
        Simple => "simple",
        /// Metadata grouped into nested sub-documents
        Verbose => "verbose",
    } default Simple
}

config_enum! {
    /// How repeats of a fingerprint are represented
    StrategyKind {
        /// Counter plus capped history on the document
        Embedded => "embedded",
        /// Latest snapshot plus an unbounded timestamp ledger
        Reference => "reference",
    } default Embedded
}

config_enum! {
    /// Write concern for ledger appends
    LedgerDurability {
        /// Strictly weaker than the primary write
        Relaxed => "relaxed",
        /// Same as the primary write
        Primary => "primary",
    } default Relaxed
}

config_enum! {
    /// Whether the embedded counter is capped along with `dates`
    CounterPolicy {
        Unbounded => "unbounded",
        Capped => "capped",
    } default Unbounded
}

config_enum! {
    /// Connect behaviour
    ConnectMode {
        /// Real handshake against the configured backend
        Live => "live",
        /// Deterministically take the failure path
        Test => "test",
    } default Live
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend address: `memory://name`, `redb://path` or a `.redb` path
    pub connection: Option<String>,
    pub database: String,
    /// Primary container
    pub collection: String,
    /// Ledger container (reference strategy)
    pub timestamp_collection: String,
    pub write_concern: WriteConcern,
    pub shape: RecordShape,
    pub strategy: StrategyKind,
    /// Cap on the embedded `dates` history
    pub max_keep: usize,
    pub time_zone: TimeZoneMode,
    /// Echo every stored document at info level
    pub verbose: bool,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub ledger_durability: LedgerDurability,
    pub counter_policy: CounterPolicy,
    /// Version recorded when a new redb file is created
    pub compat_version: Option<String>,
    /// Logger-name prefixes treated as the store's own activity
    pub internal_targets: Vec<String>,
    pub max_document_bytes: usize,
    pub mode: ConnectMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: None,
            database: "logfold".to_string(),
            collection: "records".to_string(),
            timestamp_collection: "timestamps".to_string(),
            write_concern: WriteConcern::default(),
            shape: RecordShape::default(),
            strategy: StrategyKind::default(),
            max_keep: DEFAULT_MAX_KEEP,
            time_zone: TimeZoneMode::default(),
            verbose: false,
            connect_timeout_ms: 250,
            operation_timeout_ms: 1000,
            ledger_durability: LedgerDurability::default(),
            counter_policy: CounterPolicy::default(),
            compat_version: None,
            internal_targets: vec!["logfold".to_string(), "logfold_store".to_string()],
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            mode: ConnectMode::default(),
        }
    }
}

impl StoreConfig {
    /// Defaults pointed at a backend address
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: Some(connection.into()),
            ..Default::default()
        }
    }

    /// In-memory store, mostly for tests
    pub fn in_memory() -> Self {
        Self::new("memory://")
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_shape(mut self, shape: RecordShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_max_keep(mut self, max_keep: usize) -> Self {
        self.max_keep = max_keep;
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn with_time_zone(mut self, time_zone: TimeZoneMode) -> Self {
        self.time_zone = time_zone;
        self
    }

    pub fn with_mode(mut self, mode: ConnectMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parse from TOML, then validate
    pub fn from_toml_str(text: &str) -> Result<Self, StoreError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `LOGFOLD_*` environment variables, then validated
    pub fn from_env() -> Result<Self, StoreError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a lookup keyed by the unprefixed variable name
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), StoreError> {
        if let Some(v) = lookup("CONNECTION") {
            self.connection = Some(v);
        }
        if let Some(v) = lookup("DATABASE") {
            self.database = v;
        }
        if let Some(v) = lookup("COLLECTION") {
            self.collection = v;
        }
        if let Some(v) = lookup("TIMESTAMP_COLLECTION") {
            self.timestamp_collection = v;
        }
        if let Some(v) = lookup("W") {
            self.write_concern.w = parse_number("LOGFOLD_W", &v)?;
        }
        if let Some(v) = lookup("JOURNAL") {
            self.write_concern.journal = parse_bool("LOGFOLD_JOURNAL", &v)?;
        }
        if let Some(v) = lookup("SHAPE") {
            self.shape = v.parse()?;
        }
        if let Some(v) = lookup("STRATEGY") {
            self.strategy = v.parse()?;
        }
        if let Some(v) = lookup("MAX_KEEP") {
            self.max_keep = parse_number("LOGFOLD_MAX_KEEP", &v)?;
        }
        if let Some(v) = lookup("TIME_ZONE") {
            self.time_zone = v.parse()?;
        }
        if let Some(v) = lookup("VERBOSE") {
            self.verbose = parse_bool("LOGFOLD_VERBOSE", &v)?;
        }
        if let Some(v) = lookup("CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_number("LOGFOLD_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("OPERATION_TIMEOUT_MS") {
            self.operation_timeout_ms = parse_number("LOGFOLD_OPERATION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("LEDGER_DURABILITY") {
            self.ledger_durability = v.parse()?;
        }
        if let Some(v) = lookup("COUNTER_POLICY") {
            self.counter_policy = v.parse()?;
        }
        if let Some(v) = lookup("COMPAT_VERSION") {
            self.compat_version = Some(v);
        }
        if let Some(v) = lookup("INTERNAL_TARGETS") {
            self.internal_targets = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("MAX_DOCUMENT_BYTES") {
            self.max_document_bytes = parse_number("LOGFOLD_MAX_DOCUMENT_BYTES", &v)?;
        }
        if let Some(v) = lookup("MODE") {
            self.mode = v.parse()?;
        }
        Ok(())
    }

    /// Reject missing, contradictory or unbounded settings
    pub fn validate(&self) -> Result<(), StoreError> {
        match self.connection.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(StoreError::configuration("no connection target configured"));
            }
            Some(_) => {}
        }
        self.write_concern.validate()?;
        if self.max_keep == 0 {
            return Err(StoreError::configuration("max_keep must be a positive integer"));
        }
        if self.connect_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(StoreError::configuration("timeouts must be greater than zero"));
        }
        for (label, name) in [
            ("database", &self.database),
            ("collection", &self.collection),
            ("timestamp_collection", &self.timestamp_collection),
        ] {
            if name.trim().is_empty() {
                return Err(StoreError::configuration(format!("{label} name is empty")));
            }
        }
        if self.collection == self.timestamp_collection {
            return Err(StoreError::configuration(
                "collection and timestamp_collection must differ",
            ));
        }
        if self.max_document_bytes == 0 {
            return Err(StoreError::configuration("max_document_bytes must be positive"));
        }
        self.compat()?;
        Ok(())
    }

    /// Fully qualified primary container name
    pub fn primary_container(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    /// Fully qualified ledger container name
    pub fn ledger_container(&self) -> String {
        format!("{}.{}", self.database, self.timestamp_collection)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Parsed `compat_version`
    pub fn compat(&self) -> Result<Option<ServerVersion>, StoreError> {
        self.compat_version.as_deref().map(str::parse).transpose()
    }

    /// Write concern used for ledger appends
    pub fn ledger_concern(&self) -> WriteConcern {
        match self.ledger_durability {
            LedgerDurability::Relaxed => self.write_concern.relaxed(),
            LedgerDurability::Primary => self.write_concern,
        }
    }
}

fn parse_number<T: FromStr>(var: &str, value: &str) -> Result<T, StoreError> {
    value
        .trim()
        .parse()
        .map_err(|_| StoreError::configuration(format!("{var}: '{value}' is not a number")))
}

fn parse_bool(var: &str, value: &str) -> Result<bool, StoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StoreError::configuration(format!("{var}: '{value}' is not a boolean"))),
    }
}
