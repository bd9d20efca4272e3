//! # logfold-store
//!
//! A deduplicating log-record store.
//!
//! Repeated occurrences of "the same" event (same message, same level) are
//! collapsed into one document keyed by a deterministic fingerprint. Repeats
//! are recorded in one of two ways:
//!
//! - **Embedded**: the document carries a total `counter` and a capped,
//!   oldest-first `dates` history.
//! - **Reference**: the document is the latest snapshot, and every occurrence
//!   is appended to a separate timestamp ledger.
//!
//! ## Components
//!
//! - [`KeySanitizer`]: rewrites keys the document model reserves, with rules
//!   picked from the backend version at connect time
//! - [`Fingerprint`]: UUIDv5 identity of `(message, level)`
//! - [`RecordBuilder`]: event to document, in the simple or verbose shape
//! - [`StorageEngine`]: the upsert and bounded-retry protocol
//! - [`ConnectionManager`]: bounded handshake and index bootstrap
//! - [`LogStore`]: the facade handed to callers
//! - [`StoreLayer`]: a `tracing` layer that emits into a store
//!
//! ## Example
//!
//! ```rust,ignore
//! use logfold_store::{Event, Level, LogStore, StoreConfig};
//!
//! let store = LogStore::open(StoreConfig::new("redb://./data/logs.redb"))?;
//! for _ in 0..3 {
//!     store.emit(&Event::new(Level::Error, "disk full"))?;
//! }
//! // one document, counter == 3
//! ```

pub mod backend;
pub mod builder;
pub mod config;
pub mod connection;
pub mod document;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod fingerprint;
pub mod layer;
pub mod maintenance;
pub mod sanitize;
pub mod store;
pub mod time;

// Re-exports
pub use backend::{
    DocumentBackend, MemoryBackend, RedbBackend, RedbBackendConfig, ServerVersion, WriteConcern,
};
pub use builder::{BuiltRecord, RecordBuilder};
pub use config::{
    ConnectMode, CounterPolicy, LedgerDurability, RecordShape, StoreConfig, StrategyKind,
};
pub use connection::{BackendAddress, Connection, ConnectionManager};
pub use document::{History, LedgerEntry, LogDocument};
pub use engine::{EmitOutcome, StorageEngine};
pub use error::StoreError;
pub use event::{Event, ExceptionInfo, Level, SourceLocation};
pub use filter::{Filter, FindQuery};
pub use fingerprint::Fingerprint;
pub use layer::StoreLayer;
pub use maintenance::{
    PurgeReport, PurgeScope, copy_collection, cutoff_days_ago, delete_older_than, purge, purge_all,
};
pub use sanitize::{KeyRules, KeySanitizer};
pub use store::{CollectionHandle, LedgerHandle, LogStore};
pub use time::{TimeZoneMode, Timestamp};
