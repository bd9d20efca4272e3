//! Maintenance operations for operational tooling
//!
//! These work on the containers directly. Their own log output goes to the
//! `logfold::maintenance` target, which the record builder treats as internal
//! activity, so running them never writes records about themselves.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, instrument};

use crate::error::StoreError;
use crate::filter::Filter;
use crate::store::LogStore;
use crate::time::Timestamp;

/// Documents and ledger rows removed by a purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub documents: usize,
    pub ledger_entries: usize,
    /// Documents copied to the backup container before deleting
    pub backed_up: Option<usize>,
}

/// Which records a purge removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    All,
    /// Records first seen at or before the cutoff
    OlderThan(Timestamp),
}

/// The instant `days` days before `now`
///
/// Ages that reach past the range chrono can represent are rejected.
pub fn cutoff_days_ago(now: DateTime<Utc>, days: u32) -> Result<Timestamp, StoreError> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|age| now.checked_sub_signed(age))
        .map(Timestamp::from)
        .ok_or_else(|| {
            StoreError::configuration(format!(
                "an age of {days} days reaches before the earliest representable date"
            ))
        })
}

/// Purge `scope`, optionally copying the primary container to `backup` first
///
/// Nothing is deleted when the backup copy fails.
#[instrument(target = "logfold::maintenance", skip(store))]
pub fn purge(
    store: &LogStore,
    scope: PurgeScope,
    backup: Option<&str>,
) -> Result<PurgeReport, StoreError> {
    let backed_up = match backup {
        Some(destination) => Some(copy_collection(store, destination)?),
        None => None,
    };
    let report = match scope {
        PurgeScope::All => purge_all(store)?,
        PurgeScope::OlderThan(cutoff) => delete_older_than(store, cutoff)?,
    };
    Ok(PurgeReport { backed_up, ..report })
}

/// Delete every document and every ledger row
#[instrument(target = "logfold::maintenance", skip(store))]
pub fn purge_all(store: &LogStore) -> Result<PurgeReport, StoreError> {
    let report = PurgeReport {
        documents: store.collection().delete_many(&Filter::all())?,
        ledger_entries: store.timestamp_collection().delete_before(None)?,
        backed_up: None,
    };
    info!(
        target: "logfold::maintenance",
        documents = report.documents,
        ledger_entries = report.ledger_entries,
        "Purged all records"
    );
    Ok(report)
}

/// Delete documents first seen at or before `cutoff`, and older ledger rows
#[instrument(target = "logfold::maintenance", skip(store))]
pub fn delete_older_than(
    store: &LogStore,
    cutoff: Timestamp,
) -> Result<PurgeReport, StoreError> {
    let report = PurgeReport {
        documents: store
            .collection()
            .delete_many(&Filter::all().with_first_seen_before(cutoff))?,
        ledger_entries: store.timestamp_collection().delete_before(Some(cutoff))?,
        backed_up: None,
    };
    info!(
        target: "logfold::maintenance",
        documents = report.documents,
        ledger_entries = report.ledger_entries,
        "Deleted old records"
    );
    Ok(report)
}

/// Copy the primary container to `destination`; returns the number copied
///
/// A bare name is placed in the store's database.
#[instrument(target = "logfold::maintenance", skip(store))]
pub fn copy_collection(store: &LogStore, destination: &str) -> Result<usize, StoreError> {
    let qualified = if destination.contains('.') {
        destination.to_string()
    } else {
        format!("{}.{destination}", store.config().database)
    };
    if qualified == store.collection().name()
        || qualified == store.timestamp_collection().name()
    {
        return Err(StoreError::configuration(format!(
            "cannot copy into '{qualified}': it is one of the store's own containers"
        )));
    }
    let copied = store.collection().copy_to(&qualified)?;
    info!(target: "logfold::maintenance", copied, to = %qualified, "Copied collection");
    Ok(copied)
}
