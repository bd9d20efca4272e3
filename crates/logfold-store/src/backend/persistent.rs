//! redb-backed document backend
//!
//! Layout:
//! - one `&str -> &str` table per primary container, keyed by fingerprint
//!   hex with the JSON document as value (the key is the unique index)
//! - one `(fingerprint, occurred_at_micros, seq) -> occurred_at` table per
//!   ledger container (the key is the compound index)
//! - `_meta` holds the document-model version the file was created with
//! - `_indexes` records the index specs that were bootstrapped
//!
//! redb serializes write transactions. They are additionally taken behind a
//! timed lock so a caller never waits longer than the operation timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use redb::{AccessGuard, Database, Durability, ReadableTable, TableDefinition, TableError};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{DocumentBackend, IndexSpec, ServerVersion, UpsertResult, WriteConcern};
use crate::document::{EmbeddedUpdate, LedgerEntry};
use crate::error::StoreError;
use crate::filter::Filter;
use crate::fingerprint::Fingerprint;
use crate::time::Timestamp;

// Key: setting name, Value: setting
const META: TableDefinition<&str, &str> = TableDefinition::new("_meta");

// Key: "<container>/<index name>", Value: serialized IndexSpec
const INDEXES: TableDefinition<&str, &str> = TableDefinition::new("_indexes");

// Key: ledger container name, Value: last issued sequence
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("_sequences");

const VERSION_KEY: &str = "version";

type LedgerKey<'a> = (&'a str, i64, u64);

fn documents(name: &str) -> TableDefinition<'_, &'static str, &'static str> {
    TableDefinition::new(name)
}

fn ledger(name: &str) -> TableDefinition<'_, LedgerKey<'static>, &'static str> {
    TableDefinition::new(name)
}

/// Configuration for the redb backend
#[derive(Debug, Clone)]
pub struct RedbBackendConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Version recorded when the file is first created
    pub compat_version: Option<ServerVersion>,
    /// Upper bound on waiting for the write lock
    pub operation_timeout: Duration,
}

impl Default for RedbBackendConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/logfold.redb"),
            compat_version: None,
            operation_timeout: Duration::from_millis(1000),
        }
    }
}

/// Durable backend stored in a single redb file
pub struct RedbBackend {
    db: Arc<Database>,
    version: ServerVersion,
    write_lock: Mutex<()>,
    config: RedbBackendConfig,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.config.db_path)
            .field("version", &self.version)
            .finish()
    }
}

fn durability_for(concern: WriteConcern) -> Durability {
    if concern.w == 0 {
        Durability::None
    } else if concern.journal {
        Durability::Immediate
    } else {
        Durability::Eventual
    }
}

fn ledger_row(
    key: &AccessGuard<'_, LedgerKey<'static>>,
    occurred_at: &AccessGuard<'_, &'static str>,
) -> Result<LedgerEntry, StoreError> {
    let (fingerprint, _, _) = key.value();
    Ok(LedgerEntry {
        fingerprint: fingerprint.parse()?,
        occurred_at: Timestamp::parse(occurred_at.value())?,
    })
}

/// A missing table reads as empty
fn absent_is_empty<T>(result: Result<T, TableError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl RedbBackend {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbBackendConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::connection(format!("{}: {e}", parent.display())))?;
            }
        }

        let db = Database::create(&config.db_path)
            .map_err(|e| StoreError::connection(format!("{}: {e}", config.db_path.display())))?;

        let version = Self::init_meta(&db, config.compat_version)?;
        info!(%version, "Opened redb database");

        Ok(Self {
            db: Arc::new(db),
            version,
            write_lock: Mutex::new(()),
            config,
        })
    }

    /// Read the recorded version, recording one on first open
    fn init_meta(
        db: &Database,
        compat: Option<ServerVersion>,
    ) -> Result<ServerVersion, StoreError> {
        let txn = db.begin_write()?;
        let version = {
            let mut meta = txn.open_table(META)?;
            let recorded = meta.get(VERSION_KEY)?.map(|v| v.value().to_string());
            match recorded {
                Some(raw) => raw.parse::<ServerVersion>()?,
                None => {
                    let version = compat.unwrap_or_default();
                    meta.insert(VERSION_KEY, version.to_string().as_str())?;
                    debug!(%version, "Recorded document-model version");
                    version
                }
            }
        };
        txn.open_table(INDEXES)?;
        txn.open_table(SEQUENCES)?;
        txn.commit()?;
        Ok(version)
    }

    /// Get the configuration
    pub fn config(&self) -> &RedbBackendConfig {
        &self.config
    }

    fn lock_writes(&self, operation: &str) -> Result<MutexGuard<'_, ()>, StoreError> {
        let timeout = self.config.operation_timeout;
        self.write_lock
            .try_lock_for(timeout)
            .ok_or_else(|| StoreError::timed_out(operation, timeout.as_millis() as u64))
    }

    fn parse_document(raw: &str) -> Result<Value, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::storage(format!("corrupt document: {e}")))
    }

    fn upsert_with(
        &self,
        operation: &str,
        container: &str,
        fingerprint: &Fingerprint,
        concern: WriteConcern,
        merge: impl FnOnce(Option<Value>) -> Result<Value, StoreError>,
    ) -> Result<UpsertResult, StoreError> {
        let _guard = self.lock_writes(operation)?;
        let key = fingerprint.to_hex();

        let mut txn = self.db.begin_write()?;
        txn.set_durability(durability_for(concern));
        let result = {
            let mut table = txn.open_table(documents(container))?;
            let existing = table
                .get(key.as_str())?
                .map(|raw| Self::parse_document(raw.value()))
                .transpose()?;
            let result = if existing.is_some() {
                UpsertResult::Updated
            } else {
                UpsertResult::Inserted
            };
            let next = serde_json::to_string(&merge(existing)?)?;
            table.insert(key.as_str(), next.as_str())?;
            result
        };
        txn.commit()?;
        Ok(result)
    }
}

impl Drop for RedbBackend {
    /// Commits made with `Durability::None` only reach disk once a durable
    /// commit follows, so close with one.
    fn drop(&mut self) {
        let flushed = self
            .db
            .begin_write()
            .map_err(StoreError::from)
            .and_then(|txn| txn.commit().map_err(StoreError::from));
        if let Err(e) = flushed {
            warn!(path = %self.config.db_path.display(), error = %e, "Failed to flush on close");
        }
    }
}

impl DocumentBackend for RedbBackend {
    fn ping(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        txn.open_table(META)?;
        Ok(())
    }

    fn server_version(&self) -> Result<ServerVersion, StoreError> {
        Ok(self.version)
    }

    fn ensure_index(&self, container: &str, index: &IndexSpec) -> Result<bool, StoreError> {
        let _guard = self.lock_writes("ensure_index")?;
        let key = format!("{container}/{}", index.name);

        let txn = self.db.begin_write()?;
        let created = {
            let mut indexes = txn.open_table(INDEXES)?;
            if indexes.get(key.as_str())?.is_some() {
                false
            } else {
                let spec = serde_json::to_string(index)?;
                indexes.insert(key.as_str(), spec.as_str())?;
                true
            }
        };
        txn.commit()?;

        if created {
            debug!(container, index = %index.name, "Created index");
        }
        Ok(created)
    }

    fn find_one(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Value>, StoreError> {
        let txn = self.db.begin_read()?;
        let Some(table) = absent_is_empty(txn.open_table(documents(container)))? else {
            return Ok(None);
        };
        let key = fingerprint.to_hex();
        let found = table.get(key.as_str())?;
        found.map(|raw| Self::parse_document(raw.value())).transpose()
    }

    fn upsert_embedded(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
        seed: &Value,
        update: &EmbeddedUpdate,
        concern: WriteConcern,
    ) -> Result<UpsertResult, StoreError> {
        self.upsert_with("upsert_embedded", container, fingerprint, concern, |existing| {
            match existing {
                Some(mut doc) => {
                    let map = doc
                        .as_object_mut()
                        .ok_or_else(|| StoreError::storage("stored document is not an object"))?;
                    update.apply(map)?;
                    Ok(doc)
                }
                None => Ok(seed.clone()),
            }
        })
    }

    fn replace_upsert(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
        document: &Value,
        concern: WriteConcern,
    ) -> Result<UpsertResult, StoreError> {
        self.upsert_with("replace_upsert", container, fingerprint, concern, |_| {
            Ok(document.clone())
        })
    }

    fn insert_ledger(
        &self,
        container: &str,
        entry: &LedgerEntry,
        concern: WriteConcern,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_writes("insert_ledger")?;
        let fingerprint = entry.fingerprint.to_hex();
        let occurred_at = entry.occurred_at.to_rfc3339();

        let mut txn = self.db.begin_write()?;
        txn.set_durability(durability_for(concern));
        {
            let mut sequences = txn.open_table(SEQUENCES)?;
            let seq = sequences.get(container)?.map(|v| v.value()).unwrap_or(0) + 1;
            sequences.insert(container, seq)?;

            let mut table = txn.open_table(ledger(container))?;
            table.insert(
                (fingerprint.as_str(), entry.occurred_at.timestamp_micros(), seq),
                occurred_at.as_str(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    fn scan(&self, container: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let txn = self.db.begin_read()?;
        let Some(table) = absent_is_empty(txn.open_table(documents(container)))? else {
            return Ok(Vec::new());
        };
        let mut docs = Vec::new();
        for entry in table.iter()? {
            let (_key, raw) = entry?;
            let doc = Self::parse_document(raw.value())?;
            if filter.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn delete_many(&self, container: &str, filter: &Filter) -> Result<usize, StoreError> {
        let _guard = self.lock_writes("delete_many")?;
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(documents(container))?;
            let mut doomed = Vec::new();
            for entry in table.iter()? {
                let (key, raw) = entry?;
                if filter.matches(&Self::parse_document(raw.value())?) {
                    doomed.push(key.value().to_string());
                }
            }
            for key in &doomed {
                table.remove(key.as_str())?;
            }
            doomed.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    fn ledger_entries(
        &self,
        container: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let txn = self.db.begin_read()?;
        let Some(table) = absent_is_empty(txn.open_table(ledger(container)))? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        match fingerprint.map(Fingerprint::to_hex) {
            Some(hex) => {
                let start: LedgerKey<'_> = (hex.as_str(), i64::MIN, 0);
                let end: LedgerKey<'_> = (hex.as_str(), i64::MAX, u64::MAX);
                for row in table.range(start..=end)? {
                    let (key, occurred_at) = row?;
                    entries.push(ledger_row(&key, &occurred_at)?);
                }
            }
            None => {
                for row in table.iter()? {
                    let (key, occurred_at) = row?;
                    entries.push(ledger_row(&key, &occurred_at)?);
                }
            }
        }
        Ok(entries)
    }

    fn delete_ledger_before(
        &self,
        container: &str,
        cutoff: Option<Timestamp>,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock_writes("delete_ledger_before")?;
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(ledger(container))?;
            let mut doomed = Vec::new();
            for row in table.iter()? {
                let (key, _) = row?;
                let (fp, micros, seq) = key.value();
                let expired = cutoff.is_none_or(|c| micros <= c.timestamp_micros());
                if expired {
                    doomed.push((fp.to_string(), micros, seq));
                }
            }
            for (fp, micros, seq) in &doomed {
                table.remove((fp.as_str(), *micros, *seq))?;
            }
            doomed.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    fn copy_container(&self, from: &str, to: &str) -> Result<usize, StoreError> {
        let _guard = self.lock_writes("copy_container")?;
        let txn = self.db.begin_write()?;
        let copied = {
            let source = txn.open_table(documents(from))?;
            let mut rows = Vec::new();
            for entry in source.iter()? {
                let (key, raw) = entry?;
                rows.push((key.value().to_string(), raw.value().to_string()));
            }
            drop(source);

            let mut target = txn.open_table(documents(to))?;
            for (key, raw) in &rows {
                target.insert(key.as_str(), raw.as_str())?;
            }
            rows.len()
        };
        txn.commit()?;
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_backend(compat: Option<ServerVersion>) -> (RedbBackend, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = RedbBackendConfig {
            db_path: temp_dir.path().join("test.redb"),
            compat_version: compat,
            ..Default::default()
        };
        (RedbBackend::open(config).unwrap(), temp_dir)
    }

    fn fp(msg: &str) -> Fingerprint {
        Fingerprint::compute(&json!(msg), Level::Error)
    }

    #[test]
    fn test_durability_for_concerns() {
        let journaled = WriteConcern { w: 1, journal: true };
        let acknowledged = WriteConcern::default();
        assert!(matches!(durability_for(journaled), Durability::Immediate));
        assert!(matches!(durability_for(acknowledged), Durability::Eventual));
        assert!(matches!(durability_for(WriteConcern::unacknowledged()), Durability::None));
        let majority = WriteConcern { w: 3, journal: false };
        assert!(matches!(durability_for(majority), Durability::Eventual));
    }

    #[test]
    fn test_relaxed_ledger_durability_is_weaker() {
        use crate::config::{LedgerDurability, StoreConfig};

        let journaled =
            StoreConfig::in_memory().with_write_concern(WriteConcern { w: 1, journal: true });
        assert!(matches!(durability_for(journaled.write_concern), Durability::Immediate));
        assert!(matches!(durability_for(journaled.ledger_concern()), Durability::Eventual));

        let acknowledged = StoreConfig::in_memory();
        assert!(matches!(durability_for(acknowledged.write_concern), Durability::Eventual));
        assert!(matches!(durability_for(acknowledged.ledger_concern()), Durability::None));

        let mut matched = journaled;
        matched.ledger_durability = LedgerDurability::Primary;
        assert!(matches!(durability_for(matched.ledger_concern()), Durability::Immediate));
    }

    #[test]
    fn test_version_is_recorded_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("v.redb");
        let legacy = RedbBackend::open(RedbBackendConfig {
            db_path: path.clone(),
            compat_version: Some(ServerVersion::new(3, 4)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(legacy.server_version().unwrap(), ServerVersion::new(3, 4));
        drop(legacy);

        // reopening with a different compat version keeps the recorded one
        let reopened = RedbBackend::open(RedbBackendConfig {
            db_path: path,
            compat_version: Some(ServerVersion::new(5, 0)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(reopened.server_version().unwrap(), ServerVersion::new(3, 4));
    }

    #[test]
    fn test_replace_upsert_and_find() {
        let (backend, _temp) = create_test_backend(None);
        let f = fp("disk full");
        assert!(backend.find_one("db.records", &f).unwrap().is_none());

        let first = backend
            .replace_upsert(
                "db.records",
                &f,
                &json!({"fingerprint": f.to_hex(), "v": 1}),
                WriteConcern::default(),
            )
            .unwrap();
        assert_eq!(first, UpsertResult::Inserted);
        let second = backend
            .replace_upsert(
                "db.records",
                &f,
                &json!({"fingerprint": f.to_hex(), "w": 2}),
                WriteConcern::default(),
            )
            .unwrap();
        assert_eq!(second, UpsertResult::Updated);

        let doc = backend.find_one("db.records", &f).unwrap().unwrap();
        assert_eq!(doc, json!({"fingerprint": f.to_hex(), "w": 2}));
    }

    #[test]
    fn test_ledger_range_by_fingerprint() {
        let (backend, _temp) = create_test_backend(None);
        let a = fp("a");
        let b = fp("b");
        let t0 = Timestamp::parse("2024-01-01T00:00:00Z").unwrap();
        for f in [a, b, a] {
            let entry = LedgerEntry {
                fingerprint: f,
                occurred_at: t0,
            };
            backend
                .insert_ledger("db.timestamps", &entry, WriteConcern::unacknowledged())
                .unwrap();
        }
        assert_eq!(backend.ledger_entries("db.timestamps", Some(&a)).unwrap().len(), 2);
        assert_eq!(backend.ledger_entries("db.timestamps", Some(&b)).unwrap().len(), 1);
        assert_eq!(backend.ledger_entries("db.timestamps", None).unwrap().len(), 3);
        assert_eq!(backend.delete_ledger_before("db.timestamps", None).unwrap(), 3);
    }

    #[test]
    fn test_missing_tables_read_as_empty() {
        let (backend, _temp) = create_test_backend(None);
        assert!(backend.scan("nothing", &Filter::all()).unwrap().is_empty());
        assert!(backend.ledger_entries("nothing", None).unwrap().is_empty());
    }

    #[test]
    fn test_ensure_index_is_idempotent() {
        let (backend, _temp) = create_test_backend(None);
        assert!(backend.ensure_index("c", &IndexSpec::unique_fingerprint()).unwrap());
        assert!(!backend.ensure_index("c", &IndexSpec::unique_fingerprint()).unwrap());
        assert!(backend.ensure_index("t", &IndexSpec::ledger_compound()).unwrap());
    }

    #[test]
    fn test_delete_and_copy() {
        let (backend, _temp) = create_test_backend(None);
        for msg in ["a", "b"] {
            let f = fp(msg);
            backend
                .replace_upsert(
                    "src",
                    &f,
                    &json!({"fingerprint": f.to_hex(), "msg": msg}),
                    WriteConcern::default(),
                )
                .unwrap();
        }
        assert_eq!(backend.copy_container("src", "dst").unwrap(), 2);
        let only_a = Filter::all().with_equals("msg", json!("a"));
        assert_eq!(backend.delete_many("dst", &only_a).unwrap(), 1);
        assert_eq!(backend.scan("dst", &Filter::all()).unwrap().len(), 1);
        assert_eq!(backend.scan("src", &Filter::all()).unwrap().len(), 2);
    }
}
