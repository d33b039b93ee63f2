//! An in-process [`RemoteStore`] with injectable latency and failures.
//!
//! Query results are snapshotted when a call starts and writes land when a call finishes,
//! so differing latencies reorder responses the way a real network does. Every call is
//! counted, and the number of concurrently outbound writes per record is tracked.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;

use crate::error::RemoteError;
use crate::model::{ExerciseRecord, RecordId, WorkoutRef};
use crate::remote::{BatchSaveResult, Predicate, RemoteStore, SortOrder};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    FetchById,
    FetchByQuery,
    Save,
    SaveBatch,
    Delete,
}

#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub calls: BTreeMap<Op, usize>,
    /// Saves, batch saves and deletes that named the record.
    pub writes: BTreeMap<RecordId, usize>,
    /// Highest number of writes for one record that were outbound at the same time.
    pub max_in_flight: BTreeMap<RecordId, usize>,
}

impl StoreStats {
    pub fn calls(&self, op: Op) -> usize {
        self.calls.get(&op).copied().unwrap_or(0)
    }

    pub fn writes(&self, id: &RecordId) -> usize {
        self.writes.get(id).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, id: &RecordId) -> usize {
        self.max_in_flight.get(id).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<RecordId, ExerciseRecord>,
    next_id: u64,
    latency: HashMap<Op, Duration>,
    failures: HashMap<Op, VecDeque<RemoteError>>,
    rejected_in_batch: HashSet<RecordId>,
    in_flight: HashMap<RecordId, usize>,
    saved: Vec<ExerciseRecord>,
    stats: StoreStats,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `latency` to every subsequent call of `op`.
    pub fn set_latency(&self, op: Op, latency: Duration) {
        self.lock().latency.insert(op, latency);
    }

    pub fn set_latency_all(&self, latency: Duration) {
        let mut state = self.lock();
        for op in [
            Op::FetchById,
            Op::FetchByQuery,
            Op::Save,
            Op::SaveBatch,
            Op::Delete,
        ] {
            state.latency.insert(op, latency);
        }
    }

    /// Make the next call of `op` fail with `error`. Queued failures are used in order.
    pub fn fail_next(&self, op: Op, error: RemoteError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Reject `id` inside every subsequent batch save, leaving the rest of the batch alone.
    pub fn reject_in_batch(&self, id: RecordId) {
        self.lock().rejected_in_batch.insert(id);
    }

    /// Seed a record without latency or statistics. Assigns an id if it has none.
    pub fn insert(&self, mut record: ExerciseRecord) -> RecordId {
        let mut state = self.lock();
        let id = match record.id.clone() {
            Some(id) => id,
            None => state.assign_id(),
        };
        record.id = Some(id.clone());
        state.records.insert(id.clone(), record);
        id
    }

    /// Remove a record behind the cache's back, as another device would.
    pub fn remove(&self, id: &RecordId) -> Option<ExerciseRecord> {
        self.lock().records.remove(id)
    }

    pub fn get(&self, id: &RecordId) -> Option<ExerciseRecord> {
        self.lock().records.get(id).cloned()
    }

    pub fn records_for(&self, workout: &WorkoutRef) -> Vec<ExerciseRecord> {
        let state = self.lock();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|record| &record.workout == workout)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.data.sort_index);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats.clone()
    }

    /// Every record handed to a successful `save`, in completion order.
    pub fn saved(&self) -> Vec<ExerciseRecord> {
        self.lock().saved.clone()
    }

    fn begin_call(&self, op: Op, ids: &[RecordId]) -> (Duration, Option<RemoteError>) {
        let mut state = self.lock();
        *state.stats.calls.entry(op).or_default() += 1;
        if matches!(op, Op::Save | Op::SaveBatch | Op::Delete) {
            for id in ids {
                *state.stats.writes.entry(id.clone()).or_default() += 1;
                let in_flight = {
                    let count = state.in_flight.entry(id.clone()).or_default();
                    *count += 1;
                    *count
                };
                let max = state.stats.max_in_flight.entry(id.clone()).or_default();
                *max = (*max).max(in_flight);
            }
        }
        let latency = state.latency.get(&op).copied().unwrap_or_default();
        let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
        (latency, failure)
    }

    fn end_writes(&self, ids: &[RecordId]) {
        let mut state = self.lock();
        for id in ids {
            if let Some(count) = state.in_flight.get_mut(id) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

impl MemoryState {
    fn assign_id(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId::new(format!("rec-{}", self.next_id))
    }

    fn store(&mut self, mut record: ExerciseRecord) -> Result<ExerciseRecord, RemoteError> {
        let id = match record.id.clone() {
            Some(id) if !self.records.contains_key(&id) => return Err(RemoteError::NotFound(id)),
            Some(id) => id,
            None => self.assign_id(),
        };
        record.id = Some(id.clone());
        self.records.insert(id, record.clone());
        self.saved.push(record.clone());
        Ok(record)
    }
}

async fn wait(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

impl RemoteStore for MemoryStore {
    fn fetch_by_id(
        &self,
        id: RecordId,
    ) -> BoxFuture<'_, Result<Option<ExerciseRecord>, RemoteError>> {
        async move {
            let (latency, failure) = self.begin_call(Op::FetchById, &[]);
            let snapshot = self.get(&id);
            wait(latency).await;
            match failure {
                Some(error) => Err(error),
                None => Ok(snapshot),
            }
        }
        .boxed()
    }

    fn fetch_by_query(
        &self,
        predicate: Predicate,
        sort: SortOrder,
    ) -> BoxFuture<'_, Result<Vec<ExerciseRecord>, RemoteError>> {
        async move {
            let (latency, failure) = self.begin_call(Op::FetchByQuery, &[]);
            let mut snapshot: Vec<ExerciseRecord> = self
                .lock()
                .records
                .values()
                .filter(|record| predicate.matches(record))
                .cloned()
                .collect();
            if sort == SortOrder::SortIndexAscending {
                snapshot.sort_by(|a, b| {
                    a.data
                        .sort_index
                        .cmp(&b.data.sort_index)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
            wait(latency).await;
            match failure {
                Some(error) => Err(error),
                None => Ok(snapshot),
            }
        }
        .boxed()
    }

    fn save(&self, record: ExerciseRecord) -> BoxFuture<'_, Result<ExerciseRecord, RemoteError>> {
        async move {
            let ids: Vec<RecordId> = record.id.iter().cloned().collect();
            let (latency, failure) = self.begin_call(Op::Save, &ids);
            wait(latency).await;
            let result = match failure {
                Some(error) => Err(error),
                None => self.lock().store(record),
            };
            self.end_writes(&ids);
            result
        }
        .boxed()
    }

    fn save_batch(
        &self,
        records: Vec<ExerciseRecord>,
    ) -> BoxFuture<'_, Result<BatchSaveResult, RemoteError>> {
        async move {
            let ids: Vec<RecordId> = records.iter().filter_map(|r| r.id.clone()).collect();
            let (latency, failure) = self.begin_call(Op::SaveBatch, &ids);
            wait(latency).await;
            let result = match failure {
                Some(error) => Err(error),
                None => {
                    let mut state = self.lock();
                    Ok(records
                        .into_iter()
                        .map(|record| {
                            let rejected = record
                                .id
                                .clone()
                                .filter(|id| state.rejected_in_batch.contains(id));
                            match rejected {
                                Some(id) => {
                                    Err(RemoteError::Rejected(format!("{id} rejected in batch")))
                                }
                                None => state.store(record),
                            }
                        })
                        .collect())
                }
            };
            self.end_writes(&ids);
            result
        }
        .boxed()
    }

    fn delete(&self, id: RecordId) -> BoxFuture<'_, Result<(), RemoteError>> {
        async move {
            let ids = [id];
            let (latency, failure) = self.begin_call(Op::Delete, &ids);
            wait(latency).await;
            let result = match failure {
                Some(error) => Err(error),
                None => {
                    self.lock().records.remove(&ids[0]);
                    Ok(())
                }
            };
            self.end_writes(&ids);
            result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExerciseData;

    fn record(workout: &str, name: &str, sort_index: usize) -> ExerciseRecord {
        ExerciseRecord {
            id: None,
            workout: WorkoutRef::new(workout),
            data: ExerciseData::new(name, 3, 10).with_sort_index(sort_index),
        }
    }

    #[tokio::test]
    async fn test_save_assigns_ids() {
        let store = MemoryStore::new();
        let saved = store.save(record("w", "Squats", 0)).await.unwrap();
        assert_eq!(saved.id, Some(RecordId::new("rec-1")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_save_of_deleted_record_is_not_found() {
        let store = MemoryStore::new();
        let id = store.insert(record("w", "Squats", 0));
        let mut stale = store.get(&id).unwrap();
        store.remove(&id);
        stale.data.name = "Front squats".to_string();
        assert_eq!(
            store.save(stale).await.unwrap_err(),
            RemoteError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn test_query_filters_and_sorts() {
        let store = MemoryStore::new();
        store.insert(record("w", "B", 1));
        store.insert(record("w", "A", 0));
        store.insert(record("other", "C", 0));
        let results = store
            .fetch_by_query(
                Predicate::Workout(WorkoutRef::new("w")),
                SortOrder::SortIndexAscending,
            )
            .await
            .unwrap();
        let names: Vec<_> = results.iter().map(|r| r.data.name()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_injected_failure_is_used_once() {
        let store = MemoryStore::new();
        store.fail_next(Op::FetchByQuery, RemoteError::Timeout);
        let query = || {
            store.fetch_by_query(
                Predicate::Workout(WorkoutRef::new("w")),
                SortOrder::Unsorted,
            )
        };
        assert_eq!(query().await.unwrap_err(), RemoteError::Timeout);
        assert!(query().await.unwrap().is_empty());
        assert_eq!(store.stats().calls(Op::FetchByQuery), 2);
    }

    #[tokio::test]
    async fn test_batch_partial_rejection() {
        let store = MemoryStore::new();
        let a = store.insert(record("w", "A", 0));
        let b = store.insert(record("w", "B", 1));
        store.reject_in_batch(b.clone());
        let results = store
            .save_batch(vec![store.get(&a).unwrap(), store.get(&b).unwrap()])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(RemoteError::Rejected(_))));
        assert_eq!(store.stats().writes(&a), 1);
    }
}
