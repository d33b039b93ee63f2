//! The boundary to the remote record store.
//!
//! Every call is asynchronous and may fail, time out, or (for batches) partially succeed.
//! The trait is object safe so the cache can hold an `Arc<dyn RemoteStore>`.

use futures::future::BoxFuture;

use crate::error::RemoteError;
use crate::model::{ExerciseRecord, RecordId, WorkoutRef};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Every exercise whose parent workout is the given one.
    Workout(WorkoutRef),
    /// Exactly these records, where they still exist.
    AnyOf(Vec<RecordId>),
}

impl Predicate {
    pub fn matches(&self, record: &ExerciseRecord) -> bool {
        match self {
            Predicate::Workout(workout) => &record.workout == workout,
            Predicate::AnyOf(ids) => record.id.as_ref().is_some_and(|id| ids.contains(id)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    SortIndexAscending,
    Unsorted,
}

/// Per-record outcome of [`RemoteStore::save_batch`], in request order.
pub type BatchSaveResult = Vec<Result<ExerciseRecord, RemoteError>>;

pub trait RemoteStore: Send + Sync + 'static {
    fn fetch_by_id(
        &self,
        id: RecordId,
    ) -> BoxFuture<'_, Result<Option<ExerciseRecord>, RemoteError>>;

    fn fetch_by_query(
        &self,
        predicate: Predicate,
        sort: SortOrder,
    ) -> BoxFuture<'_, Result<Vec<ExerciseRecord>, RemoteError>>;

    /// Saves `record`, assigning an identifier if it has none. Returns the stored record.
    fn save(&self, record: ExerciseRecord) -> BoxFuture<'_, Result<ExerciseRecord, RemoteError>>;

    /// The outer error means nothing was attempted; per-record failures are in the vector.
    fn save_batch(
        &self,
        records: Vec<ExerciseRecord>,
    ) -> BoxFuture<'_, Result<BatchSaveResult, RemoteError>>;

    fn delete(&self, id: RecordId) -> BoxFuture<'_, Result<(), RemoteError>>;
}
