//! End-to-end behaviour of the store against both backends

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use logfold_store::{
    ConnectMode, EmitOutcome, Event, Filter, FindQuery, Fingerprint, KeyRules, Level, LogStore,
    MemoryBackend, PurgeScope, RecordShape, StoreConfig, StoreError, StrategyKind, Timestamp,
    WriteConcern, purge,
};
use serde_json::json;
use tempfile::TempDir;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
}

fn memory_store(config: StoreConfig) -> LogStore {
    LogStore::open(config).unwrap()
}

fn redb_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(format!("redb://{}", dir.path().join("logs.redb").display()))
}

fn only_document(store: &LogStore) -> logfold_store::LogDocument {
    let docs = store.find(&FindQuery::default()).unwrap();
    assert_eq!(docs.len(), 1, "expected exactly one document");
    docs.into_iter().next().unwrap()
}

// ============================================================================
// Embedded strategy
// ============================================================================

#[test]
fn test_disk_full_three_times() {
    let store = memory_store(StoreConfig::in_memory());
    for _ in 0..3 {
        store.emit(&Event::new(Level::Error, "disk full")).unwrap();
    }

    let doc = only_document(&store);
    assert_eq!(doc.counter(), Some(3));
    assert_eq!(doc.dates().len(), 3);
    assert!(doc.dates().windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(doc.first_seen(), doc.dates()[0]);
}

#[test]
fn test_level_splits_fingerprints() {
    let store = memory_store(StoreConfig::in_memory());
    let error = store.emit(&Event::new(Level::Error, "disk full")).unwrap();
    let warning = store.emit(&Event::new(Level::Warning, "disk full")).unwrap();

    assert_ne!(error.fingerprint(), warning.fingerprint());
    assert!(matches!(warning, EmitOutcome::Inserted { .. }));
    assert_eq!(store.find(&FindQuery::default()).unwrap().len(), 2);
}

#[test]
fn test_cap_boundary_keeps_most_recent() {
    let store = memory_store(StoreConfig::in_memory().with_max_keep(3));
    let times: Vec<_> = (0..5).map(|i| base() + Duration::seconds(i)).collect();
    for t in &times {
        store.emit(&Event::new(Level::Error, "disk full").at(*t)).unwrap();
    }

    let doc = only_document(&store);
    assert_eq!(doc.counter(), Some(5));
    let kept: Vec<_> = doc.dates().iter().map(|d| d.as_datetime()).collect();
    assert_eq!(kept, times[2..].to_vec());
    assert_eq!(doc.first_seen().as_datetime(), times[0]);
}

#[test]
fn test_counting_matches_min_of_n_and_max_keep() {
    for n in [1usize, 24, 25, 26, 40] {
        let store = memory_store(StoreConfig::in_memory());
        for i in 0..n {
            let at = base() + Duration::seconds(i as i64);
            store
                .emit(&Event::new(Level::Info, json!({"job": "sync"})).at(at))
                .unwrap();
        }
        let doc = only_document(&store);
        assert_eq!(doc.counter(), Some(n as u64));
        assert_eq!(doc.dates().len(), n.min(25));
    }
}

#[test]
fn test_logger_and_location_do_not_split_records() {
    let store = memory_store(StoreConfig::in_memory());
    store.emit(&Event::new(Level::Error, "timeout").with_logger("api")).unwrap();
    store.emit(&Event::new(Level::Error, "timeout").with_logger("worker")).unwrap();
    assert_eq!(only_document(&store).counter(), Some(2));
}

// ============================================================================
// Reference strategy
// ============================================================================

#[test]
fn test_reference_ledger_completeness() {
    let store = memory_store(StoreConfig::in_memory().with_strategy(StrategyKind::Reference));
    const N: i64 = 40;
    for i in 0..N {
        store
            .emit(&Event::new(Level::Error, "disk full").at(base() + Duration::seconds(i)))
            .unwrap();
    }

    let doc = only_document(&store);
    assert_eq!(doc.counter(), None);
    assert_eq!(doc.last_seen().as_datetime(), base() + Duration::seconds(N - 1));

    let entries = store.timestamp_collection().entries_for(&doc.fingerprint).unwrap();
    assert_eq!(entries.len(), N as usize);
    assert!(entries.iter().all(|e| e.fingerprint == doc.fingerprint));
    assert!(entries.windows(2).all(|w| w[0].occurred_at <= w[1].occurred_at));
}

#[test]
fn test_reference_replace_drops_stale_fields() {
    let backend = Arc::new(MemoryBackend::new());
    let verbose = StoreConfig::in_memory()
        .with_strategy(StrategyKind::Reference)
        .with_shape(RecordShape::Verbose);
    let store = LogStore::with_backend(verbose, backend.clone()).unwrap();
    store.emit(&Event::new(Level::Error, "disk full")).unwrap();

    // same containers, now written in the simple shape
    let simple = StoreConfig::in_memory().with_strategy(StrategyKind::Reference);
    let store = LogStore::with_backend(simple, backend).unwrap();
    store.emit(&Event::new(Level::Error, "disk full")).unwrap();

    let doc = only_document(&store);
    assert!(doc.fields.get("info").is_none());
    assert_eq!(doc.fields["level"], json!("ERROR"));
}

// ============================================================================
// Key sanitization
// ============================================================================

#[test]
fn test_legacy_backend_sanitizes_every_key() {
    let backend = Arc::new(MemoryBackend::new().with_version("3.4".parse().unwrap()));
    let store = LogStore::with_backend(StoreConfig::in_memory(), backend).unwrap();
    assert_eq!(store.key_rules(), KeyRules::Legacy);

    let message = json!({"a.b": {"$c": [{"d.e": 1}]}, "plain": true});
    store.emit(&Event::new(Level::Info, message.clone())).unwrap();

    let doc = only_document(&store);
    let stored = doc.message().unwrap();
    assert_eq!(
        stored,
        &json!({"a\u{FF0E}b": {"\u{FF04}c": [{"d\u{FF0E}e": 1}]}, "plain": true})
    );
    assert_eq!(logfold_store::sanitize::restore(stored), message);
    assert_eq!(doc.fingerprint, Fingerprint::compute(&message, Level::Info));
}

#[test]
fn test_modern_backend_keeps_dots() {
    let store = memory_store(StoreConfig::in_memory());
    assert_eq!(store.key_rules(), KeyRules::Modern);
    store
        .emit(&Event::new(Level::Info, json!({"a.b": 1, "$set": 2, "x$y": 3})))
        .unwrap();
    let doc = only_document(&store);
    assert_eq!(doc.message(), Some(&json!({"a.b": 1, "\u{FF04}set": 2, "x$y": 3})));
}

// ============================================================================
// Failure handling
// ============================================================================

#[test]
fn test_test_mode_connect_fails() {
    let err = LogStore::open(StoreConfig::in_memory().with_mode(ConnectMode::Test)).unwrap_err();
    assert!(matches!(err, StoreError::Connection(_)));
}

#[test]
fn test_contradictory_write_concern_is_rejected() {
    let config = StoreConfig::in_memory().with_write_concern(WriteConcern { w: 0, journal: true });
    assert!(matches!(LogStore::open(config), Err(StoreError::Configuration(_))));
}

#[test]
fn test_unacknowledged_writes_still_store() {
    let config = StoreConfig::in_memory().with_write_concern(WriteConcern::unacknowledged());
    let store = memory_store(config);
    store.emit(&Event::new(Level::Info, "fire and forget")).unwrap();
    assert_eq!(only_document(&store).counter(), Some(1));
}

#[test]
fn test_unreachable_backend_surfaces_storage_error() {
    let backend = Arc::new(MemoryBackend::new());
    let store = LogStore::with_backend(StoreConfig::in_memory(), backend.clone()).unwrap();
    backend.set_offline(true);
    let err = store.emit(&Event::new(Level::Error, "lost")).unwrap_err();
    assert!(matches!(err, StoreError::Storage(_)));

    backend.set_offline(false);
    store.emit(&Event::new(Level::Error, "lost")).unwrap();
    assert_eq!(only_document(&store).counter(), Some(1));
}

#[test]
fn test_oversized_payload_fails_before_backend() {
    let mut config = StoreConfig::in_memory();
    config.max_document_bytes = 1024;
    let store = memory_store(config);
    let err = store.emit(&Event::new(Level::Info, "x".repeat(4096))).unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));
    assert!(store.find(&FindQuery::default()).unwrap().is_empty());
}

// ============================================================================
// redb backend
// ============================================================================

#[test]
fn test_redb_counts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = LogStore::open(redb_config(&dir)).unwrap();
        store.emit(&Event::new(Level::Error, "disk full")).unwrap();
        store.emit(&Event::new(Level::Error, "disk full")).unwrap();
    }
    let store = LogStore::open(redb_config(&dir)).unwrap();
    store.emit(&Event::new(Level::Error, "disk full")).unwrap();
    assert_eq!(only_document(&store).counter(), Some(3));
}

#[test]
fn test_redb_reference_ledger() {
    let dir = TempDir::new().unwrap();
    let store = LogStore::open(redb_config(&dir).with_strategy(StrategyKind::Reference)).unwrap();
    for i in 0..5 {
        store
            .emit(&Event::new(Level::Warning, "slow query").at(base() + Duration::minutes(i)))
            .unwrap();
    }
    store.emit(&Event::new(Level::Warning, "other")).unwrap();

    let fp = Fingerprint::compute(&json!("slow query"), Level::Warning);
    assert_eq!(store.timestamp_collection().count_for(&fp).unwrap(), 5);
    assert_eq!(store.timestamp_collection().all().unwrap().len(), 6);

    let cutoff = Timestamp::from(base() + Duration::minutes(2));
    let report = logfold_store::delete_older_than(&store, cutoff).unwrap();
    assert_eq!(report.ledger_entries, 3);
    assert_eq!(store.timestamp_collection().count_for(&fp).unwrap(), 2);
}

#[test]
fn test_redb_legacy_version_is_sticky() {
    let dir = TempDir::new().unwrap();
    let mut legacy = redb_config(&dir);
    legacy.compat_version = Some("3.4".to_string());
    {
        let store = LogStore::open(legacy).unwrap();
        assert_eq!(store.key_rules(), KeyRules::Legacy);
    }
    let store = LogStore::open(redb_config(&dir)).unwrap();
    assert_eq!(store.key_rules(), KeyRules::Legacy);
    store.emit(&Event::new(Level::Info, json!({"a.b": 1}))).unwrap();
    assert_eq!(only_document(&store).message(), Some(&json!({"a\u{FF0E}b": 1})));
}

#[test]
fn test_redb_find_filters() {
    let dir = TempDir::new().unwrap();
    let store = LogStore::open(redb_config(&dir).with_shape(RecordShape::Verbose)).unwrap();
    store
        .emit(&Event::new(Level::Info, json!({"test": "alpha"})).with_logger("app").at(base()))
        .unwrap();
    store
        .emit(
            &Event::new(Level::Info, json!({"test": "beta"}))
                .with_logger("app")
                .at(base() + Duration::hours(1)),
        )
        .unwrap();

    let query = Filter::from_json(&json!({"info.msg.test": "alpha"})).unwrap();
    let docs = store.find(&FindQuery::new(query)).unwrap();
    assert_eq!(docs.len(), 1);

    let newest = store.find(&FindQuery::default().with_limit(1)).unwrap();
    assert_eq!(newest[0].message(), Some(&json!({"test": "beta"})));
}

#[test]
fn test_redb_purge_backup_keeps_pre_purge_records() {
    let dir = TempDir::new().unwrap();
    {
        let store = LogStore::open(redb_config(&dir)).unwrap();
        store.emit(&Event::new(Level::Error, "stale").at(base())).unwrap();
        store.emit(&Event::new(Level::Error, "stale").at(base())).unwrap();
        store
            .emit(&Event::new(Level::Error, "fresh").at(base() + Duration::days(20)))
            .unwrap();

        let scope = PurgeScope::OlderThan(Timestamp::from(base() + Duration::days(10)));
        let report = purge(&store, scope, Some("before_purge")).unwrap();
        assert_eq!(report.backed_up, Some(2));
        assert_eq!(report.documents, 1);
        assert_eq!(only_document(&store).message(), Some(&json!("fresh")));
    }

    let mut backup = redb_config(&dir);
    backup.collection = "before_purge".to_string();
    let store = LogStore::open(backup).unwrap();
    let docs = store.find(&FindQuery::default()).unwrap();
    assert_eq!(docs.len(), 2);
    let stale = docs.iter().find(|doc| doc.message() == Some(&json!("stale"))).unwrap();
    assert_eq!(stale.counter(), Some(2));
}
