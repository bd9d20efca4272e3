//! In-memory document backend
//!
//! Containers are `DashMap`s keyed by fingerprint hex. Updates to an existing
//! document run under the map's shard lock and are atomic. Creating a
//! document is a check followed by an insert, which reproduces the
//! duplicate-key race of a networked document store: if a concurrent writer
//! wins, the loser gets [`StoreError::Conflict`]. An optional race window
//! between the two steps makes that race easy to provoke in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use super::{DocumentBackend, IndexSpec, ServerVersion, UpsertResult, WriteConcern};
use crate::document::{EmbeddedUpdate, LedgerEntry};
use crate::error::StoreError;
use crate::filter::Filter;
use crate::fingerprint::Fingerprint;
use crate::time::Timestamp;

#[derive(Debug, Default)]
struct MemoryContainer {
    docs: DashMap<String, Value>,
    ledger: Mutex<Vec<LedgerEntry>>,
    indexes: Mutex<Vec<IndexSpec>>,
}

/// In-process backend for tests and ephemeral stores
#[derive(Debug)]
pub struct MemoryBackend {
    containers: DashMap<String, Arc<MemoryContainer>>,
    version: ServerVersion,
    /// Pause between the existence check and the insert
    race_window: Option<Duration>,
    /// Upserts that will fail with a conflict before touching data
    injected_conflicts: AtomicUsize,
    offline: AtomicBool,
    /// Concern of the most recent write per container
    last_concern: DashMap<String, WriteConcern>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend reporting the default version
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            version: ServerVersion::default(),
            race_window: None,
            injected_conflicts: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            last_concern: DashMap::new(),
        }
    }

    /// Report a specific document-model version
    pub fn with_version(mut self, version: ServerVersion) -> Self {
        self.version = version;
        self
    }

    /// Sleep between the existence check and the insert of a new document
    pub fn with_race_window(mut self, window: Duration) -> Self {
        self.race_window = Some(window);
        self
    }

    /// Make the next `count` upserts fail with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Simulate the backend becoming unreachable (or reachable again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Write concern used by the latest write to a container
    pub fn last_concern(&self, container: &str) -> Option<WriteConcern> {
        self.last_concern.get(container).map(|c| *c)
    }

    /// Number of documents in a container
    pub fn len(&self, container: &str) -> usize {
        self.containers
            .get(container)
            .map(|c| c.docs.len())
            .unwrap_or(0)
    }

    /// Whether a container holds no documents
    pub fn is_empty(&self, container: &str) -> bool {
        self.len(container) == 0
    }

    fn container(&self, name: &str) -> Arc<MemoryContainer> {
        self.containers
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::storage("memory backend is unreachable"));
        }
        Ok(())
    }

    fn take_injected_conflict(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            trace!(container, fingerprint = %fingerprint, "Injected conflict");
            return Err(StoreError::conflict(container, fingerprint.to_hex()));
        }
        Ok(())
    }

    fn widen_race(&self) {
        if let Some(window) = self.race_window {
            std::thread::sleep(window);
        }
    }

    fn insert_new(
        &self,
        container: &MemoryContainer,
        name: &str,
        key: String,
        document: &Value,
    ) -> Result<UpsertResult, StoreError> {
        self.widen_race();
        match container.docs.entry(key) {
            Entry::Occupied(occupied) => Err(StoreError::conflict(name, occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(document.clone());
                Ok(UpsertResult::Inserted)
            }
        }
    }
}

impl DocumentBackend for MemoryBackend {
    fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    fn server_version(&self) -> Result<ServerVersion, StoreError> {
        self.check_online()?;
        Ok(self.version)
    }

    fn ensure_index(&self, container: &str, index: &IndexSpec) -> Result<bool, StoreError> {
        self.check_online()?;
        let c = self.container(container);
        let mut indexes = c.indexes.lock();
        if indexes.iter().any(|existing| existing.name == index.name) {
            return Ok(false);
        }
        indexes.push(index.clone());
        Ok(true)
    }

    fn find_one(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Value>, StoreError> {
        self.check_online()?;
        let c = self.container(container);
        let found = c.docs.get(&fingerprint.to_hex()).map(|doc| doc.value().clone());
        Ok(found)
    }

    fn upsert_embedded(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
        seed: &Value,
        update: &EmbeddedUpdate,
        concern: WriteConcern,
    ) -> Result<UpsertResult, StoreError> {
        self.check_online()?;
        self.take_injected_conflict(container, fingerprint)?;
        self.last_concern.insert(container.to_string(), concern);

        let c = self.container(container);
        let key = fingerprint.to_hex();
        if let Some(mut existing) = c.docs.get_mut(&key) {
            let map = existing
                .value_mut()
                .as_object_mut()
                .ok_or_else(|| StoreError::storage("stored document is not an object"))?;
            update.apply(map)?;
            return Ok(UpsertResult::Updated);
        }
        self.insert_new(&c, container, key, seed)
    }

    fn replace_upsert(
        &self,
        container: &str,
        fingerprint: &Fingerprint,
        document: &Value,
        concern: WriteConcern,
    ) -> Result<UpsertResult, StoreError> {
        self.check_online()?;
        self.take_injected_conflict(container, fingerprint)?;
        self.last_concern.insert(container.to_string(), concern);

        let c = self.container(container);
        let key = fingerprint.to_hex();
        if let Some(mut existing) = c.docs.get_mut(&key) {
            *existing.value_mut() = document.clone();
            return Ok(UpsertResult::Updated);
        }
        self.insert_new(&c, container, key, document)
    }

    fn insert_ledger(
        &self,
        container: &str,
        entry: &LedgerEntry,
        concern: WriteConcern,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        self.last_concern.insert(container.to_string(), concern);
        self.container(container).ledger.lock().push(entry.clone());
        Ok(())
    }

    fn scan(&self, container: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        self.check_online()?;
        let c = self.container(container);
        let docs = c
            .docs
            .iter()
            .filter(|doc| filter.matches(doc.value()))
            .map(|doc| doc.value().clone())
            .collect();
        Ok(docs)
    }

    fn delete_many(&self, container: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.check_online()?;
        let c = self.container(container);
        let mut removed = 0;
        c.docs.retain(|_, doc| {
            let hit = filter.matches(doc);
            if hit {
                removed += 1;
            }
            !hit
        });
        Ok(removed)
    }

    fn ledger_entries(
        &self,
        container: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.check_online()?;
        let c = self.container(container);
        let mut entries: Vec<LedgerEntry> = c
            .ledger
            .lock()
            .iter()
            .filter(|e| fingerprint.is_none_or(|fp| &e.fingerprint == fp))
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.fingerprint, e.occurred_at));
        Ok(entries)
    }

    fn delete_ledger_before(
        &self,
        container: &str,
        cutoff: Option<Timestamp>,
    ) -> Result<usize, StoreError> {
        self.check_online()?;
        let c = self.container(container);
        let mut ledger = c.ledger.lock();
        let before = ledger.len();
        match cutoff {
            Some(cutoff) => ledger.retain(|e| e.occurred_at > cutoff),
            None => ledger.clear(),
        }
        Ok(before - ledger.len())
    }

    fn copy_container(&self, from: &str, to: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        let source = self.container(from);
        let target = self.container(to);
        let snapshot: Vec<(String, Value)> = source
            .docs
            .iter()
            .map(|doc| (doc.key().clone(), doc.value().clone()))
            .collect();
        let copied = snapshot.len();
        for (key, doc) in snapshot {
            target.docs.insert(key, doc);
        }
        Ok(copied)
    }
}
