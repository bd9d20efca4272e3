//! The log store facade
//!
//! A [`LogStore`] is constructed once and handed to its callers; there is no
//! process-wide registry. It owns the connection, the record builder and the
//! storage engine, and exposes the containers to trusted tooling through
//! [`CollectionHandle`] and [`LedgerHandle`].

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::backend::DocumentBackend;
use crate::builder::{BuiltRecord, RecordBuilder};
use crate::config::StoreConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::document::{LedgerEntry, LogDocument};
use crate::engine::{EmitOutcome, StorageEngine};
use crate::error::StoreError;
use crate::event::Event;
use crate::filter::{Filter, FindQuery, project, sort_newest_first};
use crate::fingerprint::Fingerprint;
use crate::sanitize::KeyRules;
use crate::time::Timestamp;

/// Deduplicating log-record store
#[derive(Debug)]
pub struct LogStore {
    config: StoreConfig,
    connection: Connection,
    builder: RecordBuilder,
    engine: StorageEngine,
}

impl LogStore {
    /// Connect to the configured backend and bootstrap its indexes
    #[instrument(skip(config), fields(strategy = %config.strategy, shape = %config.shape))]
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::connect(ConnectionManager::new(config))
    }

    /// Open on top of an existing backend
    pub fn with_backend(
        config: StoreConfig,
        backend: Arc<dyn DocumentBackend>,
    ) -> Result<Self, StoreError> {
        Self::connect(ConnectionManager::with_backend(config, backend))
    }

    fn connect(manager: ConnectionManager) -> Result<Self, StoreError> {
        let connection = manager.connect(false)?;
        let config = manager.config().clone();
        let builder = RecordBuilder::from_config(&config, connection.sanitizer());
        let engine = StorageEngine::new(connection.backend().clone(), &config);
        Ok(Self {
            config,
            connection,
            builder,
            engine,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn key_rules(&self) -> KeyRules {
        self.connection.key_rules()
    }

    /// Convert an event without storing it
    pub fn build(&self, event: &Event) -> Result<BuiltRecord, StoreError> {
        self.builder.build(event)
    }

    /// Store one occurrence of an event
    pub fn emit(&self, event: &Event) -> Result<EmitOutcome, StoreError> {
        let record = self.builder.build(event)?;
        self.engine.emit(&record)
    }

    /// Matching documents, newest first by first-seen time
    pub fn find(&self, query: &FindQuery) -> Result<Vec<LogDocument>, StoreError> {
        let mut docs = self.collection().scan(&query.filter)?;
        sort_newest_first(&mut docs);
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        docs.iter()
            .map(|doc| match &query.projection {
                Some(fields) => LogDocument::from_json(&project(doc, fields)),
                None => LogDocument::from_json(doc),
            })
            .collect()
    }

    /// Primary container
    pub fn collection(&self) -> CollectionHandle {
        CollectionHandle {
            backend: self.connection.backend().clone(),
            name: self.config.primary_container(),
        }
    }

    /// Timestamp ledger container
    pub fn timestamp_collection(&self) -> LedgerHandle {
        LedgerHandle {
            backend: self.connection.backend().clone(),
            name: self.config.ledger_container(),
        }
    }
}

/// Direct access to the primary container
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    backend: Arc<dyn DocumentBackend>,
    name: String,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn find_one(&self, fingerprint: &Fingerprint) -> Result<Option<LogDocument>, StoreError> {
        self.backend
            .find_one(&self.name, fingerprint)?
            .map(|doc| LogDocument::from_json(&doc))
            .transpose()
    }

    /// Raw matching documents, unordered
    pub fn scan(&self, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        self.backend.scan(&self.name, filter)
    }

    pub fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        Ok(self.scan(filter)?.len())
    }

    pub fn delete_many(&self, filter: &Filter) -> Result<usize, StoreError> {
        self.backend.delete_many(&self.name, filter)
    }

    /// Copy every document into another container of the same backend
    pub fn copy_to(&self, target: &str) -> Result<usize, StoreError> {
        self.backend.copy_container(&self.name, target)
    }
}

/// Direct access to the timestamp ledger
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    backend: Arc<dyn DocumentBackend>,
    name: String,
}

impl LedgerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every occurrence recorded for a fingerprint, oldest first
    pub fn entries_for(&self, fingerprint: &Fingerprint) -> Result<Vec<LedgerEntry>, StoreError> {
        self.backend.ledger_entries(&self.name, Some(fingerprint))
    }

    pub fn count_for(&self, fingerprint: &Fingerprint) -> Result<usize, StoreError> {
        Ok(self.entries_for(fingerprint)?.len())
    }

    pub fn all(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.backend.ledger_entries(&self.name, None)
    }

    /// Delete entries at or before `cutoff`, or all entries for `None`
    pub fn delete_before(&self, cutoff: Option<Timestamp>) -> Result<usize, StoreError> {
        self.backend.delete_ledger_before(&self.name, cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{RecordShape, StrategyKind};
    use crate::event::Level;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_find_orders_filters_and_limits() {
        let store = LogStore::open(StoreConfig::in_memory()).unwrap();
        store.emit(&Event::new(Level::Info, "boot").with_logger("app").at(at(0))).unwrap();
        store.emit(&Event::new(Level::Error, "crash").with_logger("app").at(at(10))).unwrap();
        store.emit(&Event::new(Level::Error, "oom").with_logger("worker").at(at(20))).unwrap();

        let all = store.find(&FindQuery::default()).unwrap();
        let msgs: Vec<_> = all.iter().map(|d| d.message().cloned().unwrap()).collect();
        assert_eq!(msgs, vec![json!("oom"), json!("crash"), json!("boot")]);

        let errors = store
            .find(&FindQuery::new(Filter::all().with_level("ERROR")).with_limit(1))
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message(), Some(&json!("oom")));

        let app = store.find(&FindQuery::new(Filter::all().with_logger("app"))).unwrap();
        assert_eq!(app.len(), 2);
    }

    #[test]
    fn test_find_with_projection() {
        let config = StoreConfig::in_memory().with_shape(RecordShape::Verbose);
        let store = LogStore::open(config).unwrap();
        store
            .emit(&Event::new(Level::Warning, json!({"test": "x"})).at(at(0)))
            .unwrap();
        let docs = store
            .find(&FindQuery::default().with_projection(vec!["info.msg".to_string()]))
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].fields.keys().collect::<Vec<_>>(), vec!["info"]);
        assert_eq!(docs[0].message(), Some(&json!({"test": "x"})));
        assert_eq!(docs[0].counter(), Some(1));
    }

    #[test]
    fn test_handles_expose_containers() {
        let backend = Arc::new(MemoryBackend::new());
        let config = StoreConfig::in_memory().with_strategy(StrategyKind::Reference);
        let store = LogStore::with_backend(config, backend).unwrap();
        let outcome = store.emit(&Event::new(Level::Error, "disk full").at(at(0))).unwrap();
        store.emit(&Event::new(Level::Error, "disk full").at(at(1))).unwrap();
        let fp = outcome.fingerprint().unwrap();

        assert_eq!(store.collection().name(), "logfold.records");
        assert_eq!(store.timestamp_collection().name(), "logfold.timestamps");
        let doc = store.collection().find_one(&fp).unwrap().unwrap();
        assert_eq!(doc.last_seen().as_datetime(), at(1));
        assert_eq!(store.timestamp_collection().count_for(&fp).unwrap(), 2);
    }
}
