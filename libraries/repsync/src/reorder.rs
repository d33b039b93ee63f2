//! Persist a new display order as a dense `0..N-1` run of sort indices.
//!
//! Records are fetched fresh before the batch save so fields other than the sort index
//! are written back exactly as the store has them.

use std::collections::HashSet;
use std::time::Duration;

use chokepoint::{ChokePoint, Permit};

use crate::error::RemoteError;
use crate::model::{ExerciseRecord, RecordId};
use crate::remote::{Predicate, RemoteStore, SortOrder};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileReport {
    pub succeeded: Vec<RecordId>,
    pub failed: Vec<(RecordId, RemoteError)>,
    /// Gone from the store; nothing was written for them.
    pub missing: Vec<RecordId>,
    /// Another write held the record past the wait; the next reconcile picks them up.
    pub deferred: Vec<RecordId>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.deferred.is_empty()
    }
}

/// Give every record in `ordered` the sort index of its rank and save them in one batch.
///
/// Ranks count only records that still exist, so a missing id leaves no gap. A deferred
/// record keeps its rank without being written; the caller reconciles again to fill it.
/// Duplicate ids keep their first position. An outer error means nothing was written.
pub async fn reconcile(
    store: &dyn RemoteStore,
    guard: &ChokePoint<RecordId>,
    ordered: &[RecordId],
    guard_wait: Duration,
) -> Result<ReconcileReport, RemoteError> {
    let mut seen = HashSet::new();
    let ordered: Vec<RecordId> = ordered
        .iter()
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect();

    let mut report = ReconcileReport::default();
    if ordered.is_empty() {
        return Ok(report);
    }

    let permits: Vec<Option<Permit<RecordId>>> = futures::future::join_all(
        ordered
            .iter()
            .map(|id| guard.acquire_waiting(id.clone(), guard_wait)),
    )
    .await;

    let mut held = Vec::new();
    let mut locked = Vec::new();
    for (id, permit) in ordered.iter().zip(permits) {
        match permit {
            Some(permit) => {
                held.push(permit);
                locked.push(id.clone());
            }
            None => {
                log::debug!("Record {id} busy, deferring its sort index");
                report.deferred.push(id.clone());
            }
        }
    }
    if locked.is_empty() {
        return Ok(report);
    }

    let fetched = store
        .fetch_by_query(Predicate::AnyOf(locked.clone()), SortOrder::Unsorted)
        .await
        .inspect_err(|e| log::warn!("Could not fetch records to reorder: {e}"))?;

    let mut batch: Vec<ExerciseRecord> = Vec::with_capacity(locked.len());
    let mut rank = 0;
    for id in &ordered {
        if !locked.contains(id) {
            // deferred
            rank += 1;
            continue;
        }
        match fetched.iter().find(|record| record.id.as_ref() == Some(id)) {
            Some(record) => {
                let mut record = record.clone();
                record.data.normalize();
                record.data.sort_index = rank;
                batch.push(record);
                rank += 1;
            }
            None => report.missing.push(id.clone()),
        }
    }
    if batch.is_empty() {
        return Ok(report);
    }

    let requested: Vec<RecordId> = batch.iter().filter_map(|r| r.id.clone()).collect();
    let results = store
        .save_batch(batch)
        .await
        .inspect_err(|e| log::warn!("Batch save of {} sort indices failed: {e}", requested.len()))?;

    for (id, result) in requested.into_iter().zip(results) {
        match result {
            Ok(_) => report.succeeded.push(id),
            Err(e) => {
                log::warn!("Sort index for {id} not saved: {e}");
                report.failed.push((id, e));
            }
        }
    }
    drop(held);
    Ok(report)
}
