//! Upsert protocol for the two storage strategies
//!
//! Embedded: one atomic create-or-increment-and-cap call per occurrence.
//! Reference: one atomic replace-or-insert of the latest snapshot, then a
//! ledger append under the (normally weaker) ledger write concern.
//!
//! Uniqueness conflicts are retried exactly once. For the reference strategy a
//! second conflict is followed by one verification read: if the document now
//! exists, a concurrent writer created it and the emit succeeds. The embedded
//! strategy escalates a second conflict instead, since treating it as success
//! would drop this occurrence from `counter`.
//!
//! Backend-unreachable and other storage errors are never retried here.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{DocumentBackend, UpsertResult, WriteConcern};
use crate::builder::BuiltRecord;
use crate::config::{CounterPolicy, StoreConfig, StrategyKind};
use crate::document::{EmbeddedUpdate, LedgerEntry, LogDocument};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::time::Timestamp;

/// What a single emit did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// First occurrence of the fingerprint
    Inserted {
        fingerprint: Fingerprint,
        occurred_at: Timestamp,
    },
    /// Repeat of an existing fingerprint
    Updated {
        fingerprint: Fingerprint,
        occurred_at: Timestamp,
    },
    /// The store's own activity; nothing was written
    Skipped,
}

impl EmitOutcome {
    fn from_upsert(result: UpsertResult, fingerprint: Fingerprint, occurred_at: Timestamp) -> Self {
        match result {
            UpsertResult::Inserted => EmitOutcome::Inserted {
                fingerprint,
                occurred_at,
            },
            UpsertResult::Updated => EmitOutcome::Updated {
                fingerprint,
                occurred_at,
            },
        }
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self {
            EmitOutcome::Inserted { fingerprint, .. }
            | EmitOutcome::Updated { fingerprint, .. } => Some(*fingerprint),
            EmitOutcome::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, EmitOutcome::Skipped)
    }
}

/// Writes built records through a backend
#[derive(Debug, Clone)]
pub struct StorageEngine {
    backend: Arc<dyn DocumentBackend>,
    primary: String,
    ledger: String,
    strategy: StrategyKind,
    write_concern: WriteConcern,
    ledger_concern: WriteConcern,
    max_keep: usize,
    cap_counter: bool,
    verbose: bool,
}

impl StorageEngine {
    /// Engine for a validated configuration
    pub fn new(backend: Arc<dyn DocumentBackend>, config: &StoreConfig) -> Self {
        Self {
            backend,
            primary: config.primary_container(),
            ledger: config.ledger_container(),
            strategy: config.strategy,
            write_concern: config.write_concern,
            ledger_concern: config.ledger_concern(),
            max_keep: config.max_keep,
            cap_counter: config.counter_policy == CounterPolicy::Capped,
            verbose: config.verbose,
        }
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Persist one built record
    pub fn emit(&self, record: &BuiltRecord) -> Result<EmitOutcome, StoreError> {
        let document = match record {
            BuiltRecord::Document(document) => document,
            BuiltRecord::Internal { logger } => {
                debug!(logger = %logger, "Skipping internal record");
                return Ok(EmitOutcome::Skipped);
            }
        };

        if self.verbose {
            self.echo(document);
        }

        match self.strategy {
            StrategyKind::Embedded => self.emit_embedded(document),
            StrategyKind::Reference => self.emit_reference(document),
        }
    }

    fn emit_embedded(&self, document: &LogDocument) -> Result<EmitOutcome, StoreError> {
        let fingerprint = document.fingerprint;
        let occurred_at = document.last_seen();
        let seed = document.to_json();
        let update = EmbeddedUpdate {
            occurred_at,
            max_keep: self.max_keep,
            cap_counter: self.cap_counter,
        };

        let upsert = || {
            self.backend
                .upsert_embedded(&self.primary, &fingerprint, &seed, &update, self.write_concern)
        };
        let result = match upsert() {
            Err(e) if e.is_conflict() => {
                warn!(
                    container = %self.primary,
                    %fingerprint,
                    "Conflict on embedded upsert, retrying once"
                );
                upsert()?
            }
            other => other?,
        };

        debug!(container = %self.primary, %fingerprint, ?result, "Stored embedded record");
        Ok(EmitOutcome::from_upsert(result, fingerprint, occurred_at))
    }

    fn emit_reference(&self, document: &LogDocument) -> Result<EmitOutcome, StoreError> {
        let fingerprint = document.fingerprint;
        let occurred_at = document.last_seen();
        let body = document.to_json();

        let replace = || {
            self.backend
                .replace_upsert(&self.primary, &fingerprint, &body, self.write_concern)
        };
        let result = match replace() {
            Err(e) if e.is_conflict() => {
                warn!(
                    container = %self.primary,
                    %fingerprint,
                    "Conflict on replace, retrying once"
                );
                match replace() {
                    Err(e) if e.is_conflict() => self.verify_exists(&fingerprint, e)?,
                    other => other?,
                }
            }
            other => other?,
        };

        let entry = LedgerEntry {
            fingerprint,
            occurred_at,
        };
        self.backend
            .insert_ledger(&self.ledger, &entry, self.ledger_concern)?;

        debug!(container = %self.primary, %fingerprint, ?result, "Stored reference record");
        Ok(EmitOutcome::from_upsert(result, fingerprint, occurred_at))
    }

    /// Terminal read after a repeated conflict
    fn verify_exists(
        &self,
        fingerprint: &Fingerprint,
        conflict: StoreError,
    ) -> Result<UpsertResult, StoreError> {
        match self.backend.find_one(&self.primary, fingerprint)? {
            Some(_) => {
                debug!(
                    container = %self.primary,
                    %fingerprint,
                    "Document created by a concurrent writer"
                );
                Ok(UpsertResult::Updated)
            }
            None => Err(conflict),
        }
    }

    /// Best-effort diagnostic echo of a stored document
    fn echo(&self, document: &LogDocument) {
        match serde_json::to_string_pretty(&document.to_json()) {
            Ok(rendered) => info!(container = %self.primary, "{rendered}"),
            Err(e) => {
                warn!(container = %self.primary, error = %e, "Could not render document echo")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::builder::RecordBuilder;
    use crate::event::{Event, Level};
    use crate::sanitize::{KeyRules, KeySanitizer};
    use chrono::{Duration, TimeZone, Utc};

    fn setup(config: StoreConfig) -> (Arc<MemoryBackend>, StorageEngine, RecordBuilder) {
        let backend = Arc::new(MemoryBackend::new());
        let engine = StorageEngine::new(backend.clone(), &config);
        let builder = RecordBuilder::from_config(&config, KeySanitizer::new(KeyRules::Modern));
        (backend, engine, builder)
    }

    fn occurrence(builder: &RecordBuilder, secs: i64) -> BuiltRecord {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs);
        builder
            .build(&Event::new(Level::Error, "disk full").at(at))
            .unwrap()
    }

    #[test]
    fn test_embedded_counts_and_caps() {
        let config = StoreConfig::in_memory().with_max_keep(3);
        let (backend, engine, builder) = setup(config.clone());
        for i in 0..5 {
            engine.emit(&occurrence(&builder, i)).unwrap();
        }
        let docs = backend
            .scan(&config.primary_container(), &crate::filter::Filter::all())
            .unwrap();
        assert_eq!(docs.len(), 1);
        let doc = LogDocument::from_json(&docs[0]).unwrap();
        assert_eq!(doc.counter(), Some(5));
        assert_eq!(doc.dates().len(), 3);
    }

    #[test]
    fn test_capped_counter_policy() {
        let mut config = StoreConfig::in_memory().with_max_keep(2);
        config.counter_policy = CounterPolicy::Capped;
        let (backend, engine, builder) = setup(config.clone());
        let mut last = None;
        for i in 0..4 {
            last = engine.emit(&occurrence(&builder, i)).unwrap().fingerprint();
        }
        let doc = backend
            .find_one(&config.primary_container(), &last.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(doc["counter"], 2);
    }

    #[test]
    fn test_embedded_single_conflict_is_retried() {
        let (backend, engine, builder) = setup(StoreConfig::in_memory());
        backend.inject_conflicts(1);
        let outcome = engine.emit(&occurrence(&builder, 0)).unwrap();
        assert!(matches!(outcome, EmitOutcome::Inserted { .. }));
    }

    #[test]
    fn test_embedded_repeated_conflict_escalates() {
        let (backend, engine, builder) = setup(StoreConfig::in_memory());
        engine.emit(&occurrence(&builder, 0)).unwrap();
        backend.inject_conflicts(2);
        let err = engine.emit(&occurrence(&builder, 1)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_reference_conflicts_resolve_by_existence() {
        let config = StoreConfig::in_memory().with_strategy(StrategyKind::Reference);
        let (backend, engine, builder) = setup(config.clone());

        // first write never lands: two conflicts and nothing to find
        backend.inject_conflicts(2);
        let err = engine.emit(&occurrence(&builder, 0)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(backend.is_empty(&config.primary_container()));

        // a single conflict is absorbed by the retry
        backend.inject_conflicts(1);
        engine.emit(&occurrence(&builder, 1)).unwrap();

        // once the document exists, two conflicts end in the verification read
        backend.inject_conflicts(2);
        let outcome = engine.emit(&occurrence(&builder, 2)).unwrap();
        assert!(matches!(outcome, EmitOutcome::Updated { .. }));

        let entries = backend.ledger_entries(&config.ledger_container(), None).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_reference_ledger_uses_weaker_concern() {
        let mut config = StoreConfig::in_memory().with_strategy(StrategyKind::Reference);
        config.write_concern = WriteConcern { w: 1, journal: true };
        let (backend, engine, builder) = setup(config.clone());
        engine.emit(&occurrence(&builder, 0)).unwrap();
        assert_eq!(
            backend.last_concern(&config.primary_container()),
            Some(WriteConcern { w: 1, journal: true })
        );
        assert_eq!(
            backend.last_concern(&config.ledger_container()),
            Some(WriteConcern { w: 1, journal: false })
        );
    }

    #[test]
    fn test_offline_backend_is_not_retried() {
        let (backend, engine, builder) = setup(StoreConfig::in_memory());
        backend.set_offline(true);
        let err = engine.emit(&occurrence(&builder, 0)).unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[test]
    fn test_internal_records_are_skipped() {
        let (backend, engine, _) = setup(StoreConfig::in_memory());
        let outcome = engine
            .emit(&BuiltRecord::Internal {
                logger: "logfold::maintenance".to_string(),
            })
            .unwrap();
        assert!(outcome.is_skipped());
        assert!(backend.is_empty("logfold.records"));
    }

    #[test]
    fn test_verbose_echo_does_not_affect_write() {
        let mut config = StoreConfig::in_memory();
        config.verbose = true;
        let (_, engine, builder) = setup(config);
        assert!(engine.emit(&occurrence(&builder, 0)).is_ok());
    }
}
