//! Document backends
//!
//! A backend is the document store the engine writes through. It exposes
//! atomic per-document primitives; the engine never composes a client-side
//! read-then-write for anything that must be atomic.
//!
//! Two implementations ship with the crate:
//! - [`MemoryBackend`]: in-process, for tests and ephemeral use
//! - [`RedbBackend`]: durable, file-backed via redb

mod memory;
mod persistent;

pub use memory::MemoryBackend;
pub use persistent::{RedbBackend, RedbBackendConfig};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{EmbeddedUpdate, LedgerEntry};
use crate::error::StoreError;
use crate::filter::Filter;
use crate::fingerprint::Fingerprint;
use crate::time::Timestamp;

/// Document-model version reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl Default for ServerVersion {
    fn default() -> Self {
        Self::new(4, 0)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ServerVersion {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let parse = |part: Option<&str>| -> Result<u32, StoreError> {
            part.unwrap_or("0")
                .parse::<u32>()
                .map_err(|_| StoreError::configuration(format!("invalid version '{s}'")))
        };
        let major = parse(parts.next())?;
        let minor = parse(parts.next())?;
        Ok(Self::new(major, minor))
    }
}

/// Acknowledgement and durability requested for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConcern {
    /// Acknowledgements required; 0 means fire-and-forget
    pub w: u32,
    /// Wait for the write to reach the journal
    pub journal: bool,
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self { w: 1, journal: false }
    }
}

impl WriteConcern {
    /// Unacknowledged, unjournaled
    pub const fn unacknowledged() -> Self {
        Self { w: 0, journal: false }
    }

    /// Reject combinations that cannot be honored
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.w == 0 && self.journal {
            return Err(StoreError::configuration(
                "write concern w=0 cannot be combined with journal=true",
            ));
        }
        Ok(())
    }

    /// A strictly weaker concern for non-authoritative writes
    pub fn relaxed(&self) -> Self {
        if self.journal {
            Self { w: self.w, journal: false }
        } else {
            Self::unacknowledged()
        }
    }
}

/// Index a container must carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// Indexed fields, in order
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    /// Unique index on the fingerprint
    pub fn unique_fingerprint() -> Self {
        Self {
            name: "fingerprint_unique".to_string(),
            fields: vec!["fingerprint".to_string()],
            unique: true,
        }
    }

    /// Compound `(fingerprint, occurred_at)` ledger index
    pub fn ledger_compound() -> Self {
        Self {
            name: "fingerprint_occurred_at".to_string(),
            fields: vec!["fingerprint".to_string(), "occurred_at".to_string()],
            unique: false,
        }
    }
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    /// No document existed; one was created
    Inserted,
    /// An existing document was modified or replaced
    Updated,
}

/// Atomic document operations the store is built on
///
/// Implementations must be safe to share between threads. Every call either
/// completes, fails, or times out; none may block indefinitely.
pub trait DocumentBackend: Send + Sync + fmt::Debug {
    /// Cheap liveness check
    fn ping(&self) -> Result<(), StoreError>;

    /// Document-model version, used to pick key rules
    fn server_version(&self) -> Result<ServerVersion, StoreError>;

    /// Create an index if missing; returns whether it was created
    fn ensure_index(&self, container: &str, index: &IndexSpec) -> Result<bool, StoreError>;

    /// Fetch a document by fingerprint
    fn find_one(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Value>, StoreError>;

    /// Insert `seed` if no document has this fingerprint, otherwise apply
    /// `update` to the existing one, in a single atomic operation
    ///
    /// May fail with [`StoreError::Conflict`] when a concurrent writer
    /// created the document first.
    fn upsert_embedded(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
        seed: &Value,
        update: &EmbeddedUpdate,
        concern: WriteConcern,
    ) -> Result<UpsertResult, StoreError>;

    /// Replace the whole document for this fingerprint, inserting if absent
    ///
    /// May fail with [`StoreError::Conflict`] like [`Self::upsert_embedded`].
    fn replace_upsert(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
        document: &Value,
        concern: WriteConcern,
    ) -> Result<UpsertResult, StoreError>;

    /// Append a ledger row
    fn insert_ledger(
        &self,
        container: &str,
        entry: &LedgerEntry,
        concern: WriteConcern,
    ) -> Result<(), StoreError>;

    /// All documents matching a filter, in no particular order
    fn scan(&self, container: &str, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    /// Delete matching documents; returns how many were removed
    fn delete_many(&self, container: &str, filter: &Filter) -> Result<usize, StoreError>;

    /// Ledger rows, optionally for one fingerprint, ordered by time
    fn ledger_entries(
        &self,
        container: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Delete ledger rows at or before `cutoff` (all rows when `None`)
    fn delete_ledger_before(
        &self,
        container: &str,
        cutoff: Option<Timestamp>,
    ) -> Result<usize, StoreError>;

    /// Copy every document of one container into another, replacing by fingerprint
    fn copy_container(&self, from: &str, to: &str) -> Result<usize, StoreError>;
}
