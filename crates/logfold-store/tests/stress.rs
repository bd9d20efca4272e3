//! Concurrency tests for the upsert protocol
//!
//! A race window in the memory backend widens the gap between the existence
//! check and the insert, so concurrent first writers reliably collide on the
//! fingerprint and exercise the conflict retry.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use logfold_store::{Event, FindQuery, Level, LogStore, MemoryBackend, StoreConfig, StrategyKind};
use proptest::prelude::*;
use tempfile::TempDir;

fn emit_concurrently(store: &Arc<LogStore>, threads: usize, per_thread: usize) {
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = vec![];

    for _ in 0..threads {
        let barrier = Arc::clone(&barrier);
        let store = Arc::clone(store);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..per_thread {
                store.emit(&Event::new(Level::Error, "disk full")).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

fn racing_store(config: StoreConfig) -> Arc<LogStore> {
    let backend = Arc::new(MemoryBackend::new().with_race_window(Duration::from_millis(5)));
    Arc::new(LogStore::with_backend(config, backend).unwrap())
}

#[test]
fn test_concurrent_first_writers_lose_no_increment() {
    const THREADS: usize = 16;
    let store = racing_store(StoreConfig::in_memory());
    emit_concurrently(&store, THREADS, 1);

    let docs = store.find(&FindQuery::default()).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].counter(), Some(THREADS as u64));
    assert_eq!(docs[0].dates().len(), THREADS);
}

#[test]
fn test_concurrent_repeats_embedded() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;
    let start = Instant::now();
    let store = Arc::new(LogStore::open(StoreConfig::in_memory()).unwrap());
    emit_concurrently(&store, THREADS, PER_THREAD);

    let docs = store.find(&FindQuery::default()).unwrap();
    assert_eq!(docs[0].counter(), Some((THREADS * PER_THREAD) as u64));
    assert_eq!(docs[0].dates().len(), 25);
    println!("Stored {} occurrences in {:?}", THREADS * PER_THREAD, start.elapsed());
}

#[test]
fn test_concurrent_reference_writers() {
    const THREADS: usize = 12;
    let store = racing_store(StoreConfig::in_memory().with_strategy(StrategyKind::Reference));
    emit_concurrently(&store, THREADS, 1);

    let docs = store.find(&FindQuery::default()).unwrap();
    assert_eq!(docs.len(), 1);
    let ledger = store.timestamp_collection().entries_for(&docs[0].fingerprint).unwrap();
    assert_eq!(ledger.len(), THREADS);
}

#[test]
fn test_concurrent_redb_writers() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 10;
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(format!("redb://{}", dir.path().join("stress.redb").display()));
    let store = Arc::new(LogStore::open(config).unwrap());
    emit_concurrently(&store, THREADS, PER_THREAD);

    let docs = store.find(&FindQuery::default()).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].counter(), Some((THREADS * PER_THREAD) as u64));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_counter_equals_emitters(emitters in 2usize..10, max_keep in 1usize..6) {
        let store = racing_store(StoreConfig::in_memory().with_max_keep(max_keep));
        emit_concurrently(&store, emitters, 1);

        let docs = store.find(&FindQuery::default()).unwrap();
        prop_assert_eq!(docs.len(), 1);
        prop_assert_eq!(docs[0].counter(), Some(emitters as u64));
        prop_assert_eq!(docs[0].dates().len(), emitters.min(max_keep));
    }
}
