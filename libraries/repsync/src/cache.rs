//! The aggregate root: the ordered exercise list for the active workout.
//!
//! Every mutation lands in local state first and is visible to readers immediately.
//! The remote write is then routed by shape: field edits go through one [`Debouncer`] per
//! [`Field`], completion toggles through the [`CompletionMerger`], reorders through
//! [`reorder::reconcile`]. All writes for a record are serialized by a
//! [`ChokePoint<RecordId>`] owned by the cache.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chokepoint::ChokePoint;
use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::completion::{CompletionMerger, CompletionWriteFn, WriteOutcome};
use crate::config::SyncConfig;
use crate::debounce::{Debouncer, FlushFn, FlushOutcome};
use crate::error::{RemoteError, SyncError};
use crate::events::{CacheEvent, CacheEventKind, CacheVersion, ListenerKey, Listeners};
use crate::model::{
    Exercise, ExerciseData, ExerciseId, ExerciseRecord, Field, FieldDelta, RecordId, WorkoutRef,
};
use crate::reorder::{self, ReconcileReport};
use crate::remote::RemoteStore;
use crate::throttle::{self, FetchDecision, FetchThrottle};

const DEBOUNCED_FIELDS: [Field; 8] = [
    Field::Name,
    Field::Sets,
    Field::Reps,
    Field::Weights,
    Field::ActualReps,
    Field::SetNotes,
    Field::Note,
    Field::AccentColor,
];

// Busy means "write outbound or record not bound yet"; both clear on their own.
const COMPLETION_BUSY_RETRIES: u32 = 40;

// a round that deferred busy records is followed by one that waits out the guard timeout
const RECONCILE_ROUNDS: usize = 3;

const IDLE_ROUNDS: usize = 20;
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct ExerciseCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    guard: ChokePoint<RecordId>,
    throttle: Mutex<FetchThrottle>,
    debouncers: BTreeMap<Field, Debouncer<ExerciseId, FieldDelta>>,
    completions: CompletionMerger<ExerciseId>,
    listeners: Listeners,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // one reconcile at a time, each sending the order current when it starts
    reorder_serial: tokio::sync::Mutex<()>,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    workout: Option<WorkoutRef>,
    exercises: Vec<Exercise>,
    load_token: u64,
    // workouts that have had at least one successful load
    loaded: HashSet<WorkoutRef>,
    // deleted locally; hidden from refetches even while the remote delete is outbound
    tombstones: HashSet<RecordId>,
    adds_in_flight: HashSet<ExerciseId>,
    // deleted while their first save was outbound; the record it creates is removed again
    deleted_locals: HashSet<ExerciseId>,
    // field writes a fetch may not have seen yet, re-applied over fetched copies
    field_writes: HashMap<ExerciseId, Vec<FieldWrite>>,
    next_write: u64,
    version: CacheVersion,
    last_error: Option<RemoteError>,
}

impl CacheState {
    fn bump(&mut self, changed: bool) -> CacheVersion {
        if changed {
            self.version.state += 1;
        }
        self.version.refresh += 1;
        self.version
    }

    fn position(&self, id: ExerciseId) -> Option<usize> {
        self.exercises.iter().position(|exercise| exercise.id == id)
    }

    fn get(&self, id: ExerciseId) -> Option<&Exercise> {
        self.exercises.iter().find(|exercise| exercise.id == id)
    }

    fn get_mut(&mut self, id: ExerciseId) -> Option<&mut Exercise> {
        self.exercises.iter_mut().find(|exercise| exercise.id == id)
    }

    fn id_for_record(&self, record_id: &RecordId) -> Option<ExerciseId> {
        self.exercises
            .iter()
            .find(|exercise| exercise.record_id.as_ref() == Some(record_id))
            .map(|exercise| exercise.id)
    }

    /// Bound records in display order. Local-only entries are left out.
    fn bound_order(&self) -> Vec<RecordId> {
        self.exercises
            .iter()
            .filter_map(|exercise| exercise.record_id.clone())
            .collect()
    }

    fn is_current(&self, token: u64, workout: &WorkoutRef) -> bool {
        self.load_token == token && self.workout.as_ref() == Some(workout)
    }

    fn begin_field_write(&mut self, id: ExerciseId, delta: FieldDelta) -> u64 {
        self.next_write += 1;
        let seq = self.next_write;
        self.field_writes.entry(id).or_default().push(FieldWrite {
            seq,
            delta,
            settled_at: None,
        });
        seq
    }

    /// Fetches issued from now on see the write (or its failure); earlier ones may not.
    fn settle_field_write(&mut self, id: ExerciseId, seq: u64) {
        let token = self.load_token;
        if let Some(write) = self
            .field_writes
            .get_mut(&id)
            .and_then(|writes| writes.iter_mut().find(|write| write.seq == seq))
        {
            write.settled_at = Some(token);
        }
    }

    /// Writes a fetch issued under `token` may have missed, oldest first.
    fn unseen_writes(&self, id: ExerciseId, token: u64) -> Vec<FieldDelta> {
        self.field_writes
            .get(&id)
            .map(|writes| {
                writes
                    .iter()
                    .filter(|write| write.settled_at.is_none_or(|settled| settled >= token))
                    .map(|write| write.delta.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget writes that every fetch from `token` on already reflects.
    fn prune_field_writes(&mut self, token: u64) {
        self.field_writes.retain(|_, writes| {
            writes.retain(|write| write.settled_at.is_none_or(|settled| settled >= token));
            !writes.is_empty()
        });
    }
}

struct FieldWrite {
    seq: u64,
    delta: FieldDelta,
    // load token current when the write finished
    settled_at: Option<u64>,
}

enum FlushTarget {
    Gone,
    AwaitingFirstSave,
    Resend,
    Bound(RecordId, DateTime<Utc>),
}

enum BindOutcome {
    Bound {
        version: CacheVersion,
        record_id: RecordId,
        moved: bool,
    },
    Orphan(RecordId),
    Unloaded(RecordId),
}

impl ExerciseCache {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let debouncers = DEBOUNCED_FIELDS
            .iter()
            .map(|field| (*field, Debouncer::new(config.debounce.quiet_period(*field))))
            .collect();
        Self {
            inner: Arc::new(CacheInner {
                store,
                guard: ChokePoint::new(config.guard_timeout()),
                throttle: Mutex::new(FetchThrottle::new(config.throttle.clone())),
                debouncers,
                completions: CompletionMerger::new(
                    config.completion_coalesce(),
                    COMPLETION_BUSY_RETRIES,
                ),
                listeners: Listeners::default(),
                tasks: Mutex::new(Vec::new()),
                reorder_serial: tokio::sync::Mutex::new(()),
                state: Mutex::new(CacheState::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The per-record write guard, exposed for inspection.
    pub fn guard(&self) -> &ChokePoint<RecordId> {
        &self.inner.guard
    }

    pub fn active_workout(&self) -> Option<WorkoutRef> {
        self.inner.lock().workout.clone()
    }

    /// The current list in display order, with pending completion toggles applied.
    pub fn exercises(&self) -> Vec<Exercise> {
        let mut exercises = self.inner.lock().exercises.clone();
        for exercise in &mut exercises {
            self.inner.overlay_completions(exercise);
        }
        exercises
    }

    pub fn exercise(&self, id: ExerciseId) -> Option<Exercise> {
        let mut exercise = self.committed(id)?;
        self.inner.overlay_completions(&mut exercise);
        Some(exercise)
    }

    /// The entity as last confirmed, without pending completion toggles.
    pub fn committed(&self, id: ExerciseId) -> Option<Exercise> {
        self.inner.lock().get(id).cloned()
    }

    pub fn display_completions(&self, id: ExerciseId) -> Option<Vec<bool>> {
        self.exercise(id)
            .map(|exercise| exercise.data.set_completions.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().exercises.is_empty()
    }

    pub fn version(&self) -> CacheVersion {
        self.inner.lock().version
    }

    /// The last remote failure that was given up on. Local state is unaffected by it.
    pub fn last_error(&self) -> Option<RemoteError> {
        self.inner.lock().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.inner.lock().last_error = None;
    }

    pub fn has_pending_writes(&self) -> bool {
        self.inner
            .debouncers
            .values()
            .any(|debouncer| debouncer.pending_count() > 0)
            || self.inner.completions.has_pending()
            || !self.inner.lock().adds_in_flight.is_empty()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.inner.listeners.register(listener)
    }

    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.inner.listeners.unregister(key)
    }

    /// Fetch `workout` and replace the list if the result differs from what is shown.
    ///
    /// Returns whether the list changed. Only a failure for a workout that has never
    /// loaded is an error; later failures keep the current list, set the error flag and
    /// return `Ok(false)`.
    pub async fn load(&self, workout: WorkoutRef, force_refresh: bool) -> Result<bool, SyncError> {
        let switching = self
            .inner
            .lock()
            .workout
            .as_ref()
            .is_some_and(|active| active != &workout);
        if switching {
            log::info!("Switching to workout {workout}, flushing pending edits first");
            self.flush_pending().await;
        }

        let token = {
            let mut state = self.inner.lock();
            state.load_token += 1;
            if state.workout.as_ref() != Some(&workout) {
                state.workout = Some(workout.clone());
                state.exercises.retain(|exercise| exercise.workout == workout);
            }
            state.load_token
        };

        let (decision, expects_results) = {
            let throttle = self.inner.throttle();
            (
                throttle.should_fetch(&workout, force_refresh),
                throttle.expects_results(&workout),
            )
        };

        let records = match decision {
            FetchDecision::SkipEmpty => {
                log::debug!("Fetch for {workout} throttled, nothing cached");
                return Ok(false);
            }
            FetchDecision::SkipWithCache(records) => {
                // the cached set predates any local commit since; it only fills an empty list
                let showing = {
                    let state = self.inner.lock();
                    state.loaded.contains(&workout) && !state.exercises.is_empty()
                };
                if showing {
                    log::debug!("Fetch for {workout} throttled, keeping the current list");
                    return Ok(false);
                }
                log::debug!(
                    "Fetch for {workout} throttled, using {} cached records",
                    records.len()
                );
                records
            }
            FetchDecision::Proceed => {
                let config = &self.inner.config.throttle;
                let fetched = throttle::fetch_with_retry(
                    self.inner.store.as_ref(),
                    &workout,
                    config.fetch_attempts,
                    config.retry_backoff(),
                    expects_results,
                )
                .await;
                match fetched {
                    Ok(records) => {
                        if self.inner.lock().is_current(token, &workout) {
                            self.inner.throttle().record_fetch(&workout, &records);
                        }
                        records
                    }
                    Err(source) => return self.inner.fetch_failed(token, workout, source),
                }
            }
        };

        Ok(self.inner.apply_fetched(token, &workout, records))
    }

    /// Insert `data` at the end of the active workout and save it in the background.
    pub fn add(&self, data: ExerciseData) -> Result<ExerciseId, SyncError> {
        let (id, version) = {
            let mut state = self.inner.lock();
            let workout = state.workout.clone().ok_or(SyncError::NoActiveWorkout)?;
            let sort_index = state
                .exercises
                .iter()
                .map(|exercise| exercise.data.sort_index + 1)
                .max()
                .unwrap_or(0);

            let mut data = data;
            data.normalize();
            data.sort_index = sort_index;
            data.touch();
            let exercise = Exercise::local(workout, data);
            let id = exercise.id;
            state.exercises.push(exercise);
            state.adds_in_flight.insert(id);
            (id, state.bump(true))
        };

        log::debug!("Added exercise {id}");
        self.inner.emit(version, CacheEventKind::Inserted(id));
        let inner = Arc::clone(&self.inner);
        self.inner.spawn(inner.save_new(id).boxed());
        Ok(id)
    }

    /// Apply `deltas` locally in one step and queue their remote writes.
    ///
    /// Nothing is applied if any delta is rejected.
    pub fn update(&self, id: ExerciseId, deltas: Vec<FieldDelta>) -> Result<(), SyncError> {
        let mut fields = Vec::new();
        let (settled, completion_edits, committed, sets, version) = {
            let mut state = self.inner.lock();
            let exercise = state.get(id).ok_or(SyncError::UnknownExercise(id))?;
            let mut data = exercise.data.clone();
            let mut completion_edits = Vec::new();
            for delta in &deltas {
                match delta {
                    FieldDelta::ToggleCompletion(index) if *index >= data.sets => {
                        return Err(SyncError::SetIndexOutOfRange {
                            index: *index,
                            sets: data.sets,
                        });
                    }
                    FieldDelta::ToggleCompletion(_) | FieldDelta::Completions(_) => {
                        completion_edits.push(delta.clone())
                    }
                    _ => data.apply(delta)?,
                }
                if !fields.contains(&delta.field()) {
                    fields.push(delta.field());
                }
            }

            let changed = data != exercise.data;
            let settled: Vec<(Field, FieldDelta)> = fields
                .iter()
                .filter(|field| **field != Field::Completions)
                .map(|field| (*field, FieldDelta::settled(*field, &data)))
                .collect();
            let committed = data.set_completions.clone();
            let sets = data.sets;
            if changed {
                if let Some(exercise) = state.get_mut(id) {
                    exercise.data = data;
                }
            }
            (settled, completion_edits, committed, sets, state.bump(changed))
        };

        self.inner.completions.resize(&id, sets);
        for (field, delta) in settled {
            if let Some(debouncer) = self.inner.debouncers.get(&field) {
                debouncer.schedule(id, delta, self.inner.field_flush(id));
            }
        }
        for edit in completion_edits {
            match edit {
                FieldDelta::ToggleCompletion(index) => {
                    self.inner
                        .completions
                        .toggle(id, index, &committed, self.inner.completion_writer());
                }
                FieldDelta::Completions(mut values) => {
                    values.resize(sets, false);
                    self.inner
                        .completions
                        .replace(id, values, self.inner.completion_writer());
                }
                _ => {}
            }
        }

        self.inner
            .emit(version, CacheEventKind::Updated { id, fields });
        Ok(())
    }

    /// Flip one set's completion. Returns the completions readers now see.
    pub fn toggle_completion(&self, id: ExerciseId, index: usize) -> Result<Vec<bool>, SyncError> {
        self.update(id, vec![FieldDelta::ToggleCompletion(index)])?;
        self.display_completions(id)
            .ok_or(SyncError::UnknownExercise(id))
    }

    /// Remove from the list now; the remote delete runs in the background and its failure
    /// is only logged.
    pub fn delete(&self, id: ExerciseId) -> Result<(), SyncError> {
        let (removed, version) = {
            let mut state = self.inner.lock();
            let index = state.position(id).ok_or(SyncError::UnknownExercise(id))?;
            let removed = state.exercises.remove(index);
            match &removed.record_id {
                Some(record_id) => {
                    state.tombstones.insert(record_id.clone());
                }
                None if state.adds_in_flight.contains(&id) => {
                    state.deleted_locals.insert(id);
                }
                None => {}
            }
            (removed, state.bump(true))
        };

        for debouncer in self.inner.debouncers.values() {
            debouncer.cancel(&id);
        }
        self.inner.completions.clear(&id);

        if let Some(record_id) = removed.record_id {
            self.inner
                .throttle()
                .forget_record(&removed.workout, &record_id);
            let inner = Arc::clone(&self.inner);
            self.inner.spawn(inner.delete_remote(record_id).boxed());
        }

        self.inner.emit(version, CacheEventKind::Removed(id));
        Ok(())
    }

    /// Move `id` to `new_index` (clamped), renumber the list and persist the new order.
    pub fn reorder(&self, id: ExerciseId, new_index: usize) -> Result<(), SyncError> {
        let version = {
            let mut state = self.inner.lock();
            let from = state.position(id).ok_or(SyncError::UnknownExercise(id))?;
            let exercise = state.exercises.remove(from);
            let to = new_index.min(state.exercises.len());
            state.exercises.insert(to, exercise);

            let mut changed = from != to;
            for (position, exercise) in state.exercises.iter_mut().enumerate() {
                if exercise.data.sort_index != position {
                    exercise.data.sort_index = position;
                    changed = true;
                }
            }
            state.bump(changed)
        };

        self.inner.emit(version, CacheEventKind::Reordered);
        let inner = Arc::clone(&self.inner);
        self.inner.spawn(inner.reconcile_order().boxed());
        Ok(())
    }

    /// Send every debounced edit now and wake the completion queues, as on focus loss.
    pub async fn flush_pending(&self) {
        futures::future::join_all(
            self.inner
                .debouncers
                .values()
                .map(|debouncer| debouncer.flush_all()),
        )
        .await;
        self.inner.completions.flush_all().await;
    }

    /// Flush and wait for background saves, deletes and reorders to finish.
    pub async fn wait_idle(&self) {
        for _ in 0..IDLE_ROUNDS {
            self.flush_pending().await;
            let tasks = std::mem::take(&mut *self.inner.tasks());
            if tasks.is_empty() {
                if !self.has_pending_writes() {
                    return;
                }
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        log::error!("Background sync task panicked: {e}");
                    }
                }
            }
        }
        log::warn!("Cache still has pending writes after {IDLE_ROUNDS} rounds");
    }

    /// End the session: flush, then cancel everything still outstanding and empty the list.
    pub async fn teardown(&self) {
        self.flush_pending().await;
        for debouncer in self.inner.debouncers.values() {
            debouncer.cancel_all();
        }
        self.inner.completions.cancel_all();
        for task in std::mem::take(&mut *self.inner.tasks()) {
            task.abort();
        }
        self.inner.guard.clear();

        let (workout, version) = {
            let mut state = self.inner.lock();
            let changed = !state.exercises.is_empty();
            state.exercises.clear();
            state.adds_in_flight.clear();
            state.deleted_locals.clear();
            state.field_writes.clear();
            (state.workout.take(), state.bump(changed))
        };
        if let Some(workout) = &workout {
            self.inner.throttle().clear(workout);
            log::info!("Tore down workout {workout}");
        }
        self.inner.emit(version, CacheEventKind::Cleared);
    }
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn throttle(&self) -> MutexGuard<'_, FetchThrottle> {
        self.throttle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, version: CacheVersion, kind: CacheEventKind) {
        self.listeners.emit(&CacheEvent { version, kind });
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime available, background sync task dropped");
            return;
        };
        let mut tasks = self.tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle.spawn(task));
    }

    fn report_failure(&self, id: Option<ExerciseId>, error: RemoteError) {
        let version = {
            let mut state = self.lock();
            state.last_error = Some(error.clone());
            state.bump(false)
        };
        self.emit(version, CacheEventKind::SyncFailed { id, error });
    }

    fn overlay_completions(&self, exercise: &mut Exercise) {
        exercise.data.set_completions = self
            .completions
            .display(&exercise.id, &exercise.data.set_completions);
        exercise.data.normalize();
    }

    // Edits on the wire or still waiting in a debouncer would otherwise be hidden by an
    // older remote copy. Outbound ones go first; queued ones are newer.
    fn overlay_pending_edits(&self, exercise: &mut Exercise, outbound: &[FieldDelta]) -> bool {
        let queued = self
            .debouncers
            .values()
            .filter_map(|debouncer| debouncer.pending_value(&exercise.id));
        let mut applied = false;
        for delta in outbound.iter().cloned().chain(queued) {
            match exercise.data.apply(&delta) {
                Ok(()) => applied = true,
                Err(e) => log::debug!("Pending edit for {} no longer applies: {e}", exercise.id),
            }
        }
        applied
    }

    fn fetch_failed(
        &self,
        token: u64,
        workout: WorkoutRef,
        source: RemoteError,
    ) -> Result<bool, SyncError> {
        let version = {
            let mut state = self.lock();
            if !state.is_current(token, &workout) {
                log::debug!("Discarding failure of superseded fetch for {workout}");
                return Ok(false);
            }
            state.last_error = Some(source.clone());
            if !state.loaded.contains(&workout) {
                log::error!("First load of workout {workout} failed: {source}");
                return Err(SyncError::Fetch { workout, source });
            }
            state.bump(false)
        };
        log::warn!("Reloading workout {workout} failed, keeping cached list: {source}");
        self.emit(
            version,
            CacheEventKind::SyncFailed {
                id: None,
                error: source,
            },
        );
        Ok(false)
    }

    fn apply_fetched(&self, token: u64, workout: &WorkoutRef, records: Vec<ExerciseRecord>) -> bool {
        let (changed, count, version) = {
            let mut state = self.lock();
            if !state.is_current(token, workout) {
                log::debug!("Discarding stale fetch result for {workout}");
                return false;
            }

            let mut fresh: Vec<Exercise> = Vec::with_capacity(records.len());
            for record in records {
                let Some(record_id) = record.id.clone() else {
                    log::warn!("Ignoring record without an identifier in {workout}");
                    continue;
                };
                if state.tombstones.contains(&record_id)
                    || &record.workout != workout
                    || fresh.iter().any(|e| e.record_id.as_ref() == Some(&record_id))
                {
                    continue;
                }

                let existing = state
                    .exercises
                    .iter()
                    .find(|e| e.record_id.as_ref() == Some(&record_id));
                let id = existing.map(|e| e.id).unwrap_or_default();
                let mut exercise = Exercise::from_record(id, record);
                let unseen = state.unseen_writes(id, token);
                if self.overlay_pending_edits(&mut exercise, &unseen) {
                    if let Some(existing) = existing {
                        exercise.data.timestamp = existing.data.timestamp;
                    }
                }
                fresh.push(exercise);
            }
            fresh.extend(
                state
                    .exercises
                    .iter()
                    .filter(|e| e.is_local_only() && &e.workout == workout)
                    .cloned(),
            );
            fresh.sort_by_key(|e| e.data.sort_index);

            let changed = fresh != state.exercises;
            if changed {
                state.exercises = fresh;
            }
            state.loaded.insert(workout.clone());
            state.prune_field_writes(token);
            (changed, state.exercises.len(), state.bump(changed))
        };

        log::debug!("Loaded {count} exercises for {workout} (changed: {changed})");
        self.emit(
            version,
            CacheEventKind::Loaded {
                workout: workout.clone(),
                count,
                changed,
            },
        );
        changed
    }

    fn field_flush(self: &Arc<Self>, id: ExerciseId) -> FlushFn<FieldDelta> {
        let inner = Arc::downgrade(self);
        Arc::new(move |delta| {
            let inner = inner.clone();
            async move {
                match inner.upgrade() {
                    Some(inner) => inner.flush_field(id, delta).await,
                    None => FlushOutcome::Done,
                }
            }
            .boxed()
        })
    }

    fn completion_writer(self: &Arc<Self>) -> CompletionWriteFn<ExerciseId> {
        let inner = Arc::downgrade(self);
        Arc::new(move |id, snapshot| {
            let inner = inner.clone();
            async move {
                match inner.upgrade() {
                    Some(inner) => inner.write_completions(id, snapshot).await,
                    None => WriteOutcome::Abandoned,
                }
            }
            .boxed()
        })
    }

    async fn flush_field(self: &Arc<Self>, id: ExerciseId, delta: FieldDelta) -> FlushOutcome {
        let field = delta.field();
        let target = {
            let mut state = self.lock();
            let found = state.get(id).map(|e| (e.record_id.clone(), e.data.timestamp));
            match found {
                None => FlushTarget::Gone,
                Some((Some(record_id), stamp)) => FlushTarget::Bound(record_id, stamp),
                // whoever inserts becomes the one sending the first save
                Some((None, _)) if state.adds_in_flight.insert(id) => FlushTarget::Resend,
                Some((None, _)) => FlushTarget::AwaitingFirstSave,
            }
        };

        let (record_id, stamp) = match target {
            FlushTarget::Gone => {
                log::debug!("Dropping {field:?} edit for deleted exercise {id}");
                return FlushOutcome::Done;
            }
            FlushTarget::AwaitingFirstSave => return FlushOutcome::Deferred,
            FlushTarget::Resend => {
                log::info!("Exercise {id} was never saved, sending it again with the {field:?} edit");
                self.spawn(Arc::clone(self).save_new(id).boxed());
                return FlushOutcome::Done;
            }
            FlushTarget::Bound(record_id, stamp) => (record_id, stamp),
        };

        let Some(permit) = self.guard.acquire(record_id.clone()) else {
            log::debug!("Write for {record_id} outbound, deferring {field:?} edit");
            return FlushOutcome::Deferred;
        };
        let seq = self.lock().begin_field_write(id, delta.clone());
        let result = self
            .retry_transient(&format!("Updating {field:?} of {record_id}"), || {
                self.fetch_modify_save(&record_id, &delta, stamp)
            })
            .await;
        self.lock().settle_field_write(id, seq);
        drop(permit);

        match result {
            Ok(_) => log::debug!("Saved {field:?} of {record_id}"),
            Err(RemoteError::NotFound(_)) => {
                log::info!("{record_id} is gone remotely, dropping {field:?} edit")
            }
            Err(e) => {
                log::warn!("Giving up on {field:?} edit for {record_id}: {e}");
                self.report_failure(Some(id), e);
            }
        }
        FlushOutcome::Done
    }

    async fn write_completions(self: &Arc<Self>, id: ExerciseId, snapshot: Vec<bool>) -> WriteOutcome {
        let record_id = {
            let state = self.lock();
            match state.get(id) {
                None => return WriteOutcome::Abandoned,
                Some(exercise) => exercise.record_id.clone(),
            }
        };
        let Some(record_id) = record_id else {
            return WriteOutcome::Busy;
        };
        let Some(permit) = self.guard.acquire(record_id.clone()) else {
            return WriteOutcome::Busy;
        };

        let delta = FieldDelta::Completions(snapshot);
        let stamp = Utc::now();
        let result = self
            .retry_transient(&format!("Saving completions of {record_id}"), || {
                self.fetch_modify_save(&record_id, &delta, stamp)
            })
            .await;
        drop(permit);

        match result {
            Ok(saved) => {
                let version = {
                    let mut state = self.lock();
                    let changed = match state.get_mut(id) {
                        Some(exercise) => {
                            exercise.data.set_completions = saved.data.set_completions;
                            exercise.data.normalize();
                            exercise.data.timestamp = saved.data.timestamp;
                            true
                        }
                        None => false,
                    };
                    state.bump(changed)
                };
                self.emit(version, CacheEventKind::CompletionsCommitted(id));
                WriteOutcome::Written
            }
            Err(RemoteError::NotFound(_)) => {
                log::info!("{record_id} is gone remotely, abandoning completion write");
                WriteOutcome::Abandoned
            }
            Err(e) => {
                self.report_failure(Some(id), e);
                WriteOutcome::Failed
            }
        }
    }

    async fn fetch_modify_save(
        &self,
        record_id: &RecordId,
        delta: &FieldDelta,
        stamp: DateTime<Utc>,
    ) -> Result<ExerciseRecord, RemoteError> {
        let mut record = self
            .store
            .fetch_by_id(record_id.clone())
            .await?
            .ok_or_else(|| RemoteError::NotFound(record_id.clone()))?;
        record.data.normalize();
        record
            .data
            .apply(delta)
            .map_err(|e| RemoteError::Rejected(e.to_string()))?;
        record.data.timestamp = stamp;
        self.store.save(record).await
    }

    async fn retry_transient<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let attempts = self.config.write_retry_attempts;
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    attempt += 1;
                    log::warn!("{what} failed: {e}, retry {attempt}/{attempts}");
                    tokio::time::sleep(self.config.write_retry_backoff()).await;
                }
                result => return result,
            }
        }
    }

    async fn save_new(self: Arc<Self>, id: ExerciseId) {
        let snapshot = {
            let state = self.lock();
            state
                .get(id)
                .map(|exercise| (exercise.to_record(), exercise.temp_id.clone()))
        };
        let Some((record, temp_id)) = snapshot else {
            log::debug!("Exercise {id} deleted before its first save");
            let mut state = self.lock();
            state.adds_in_flight.remove(&id);
            state.deleted_locals.remove(&id);
            return;
        };

        let result = self
            .retry_transient(&format!("Saving new exercise {id}"), || {
                self.store.save(record.clone())
            })
            .await;
        match result {
            Ok(saved) => self.bind(id, temp_id, saved).await,
            Err(e) => {
                log::error!("Could not save new exercise {id}: {e}");
                self.lock().adds_in_flight.remove(&id);
                self.report_failure(Some(id), e);
            }
        }
    }

    async fn bind(self: &Arc<Self>, id: ExerciseId, temp_id: Option<String>, saved: ExerciseRecord) {
        let Some(record_id) = saved.id.clone() else {
            log::error!("Store saved exercise {id} without assigning an identifier");
            self.lock().adds_in_flight.remove(&id);
            return;
        };

        let outcome = {
            let mut state = self.lock();
            state.adds_in_flight.remove(&id);
            let deleted = state.deleted_locals.remove(&id);
            let position = state
                .exercises
                .iter()
                .position(|e| e.temp_id.is_some() && e.temp_id == temp_id);
            match position {
                Some(position) => {
                    let exercise = &mut state.exercises[position];
                    exercise.record_id = Some(record_id.clone());
                    exercise.temp_id = None;
                    let moved = exercise.data.sort_index != saved.data.sort_index;
                    BindOutcome::Bound {
                        version: state.bump(true),
                        record_id,
                        moved,
                    }
                }
                None if deleted => BindOutcome::Orphan(record_id),
                None => BindOutcome::Unloaded(record_id),
            }
        };

        match outcome {
            BindOutcome::Bound {
                version,
                record_id,
                moved,
            } => {
                log::debug!("Exercise {id} bound to {record_id}");
                self.emit(version, CacheEventKind::Bound { id, record_id });
                if moved {
                    log::debug!("Exercise {id} moved while its first save was outbound, reconciling");
                    Arc::clone(self).reconcile_order().await;
                }
            }
            BindOutcome::Orphan(record_id) => {
                log::info!("Exercise {id} deleted before its save finished, removing {record_id}");
                Arc::clone(self).delete_remote(record_id).await;
            }
            BindOutcome::Unloaded(record_id) => {
                log::info!("Saved {record_id} after its workout was unloaded");
            }
        }
    }

    async fn delete_remote(self: Arc<Self>, record_id: RecordId) {
        let permit = self
            .guard
            .acquire_waiting(record_id.clone(), self.config.guard_wait())
            .await;
        if permit.is_none() {
            log::warn!("Deleting {record_id} while another write for it is still outbound");
        }
        let result = self
            .retry_transient(&format!("Deleting {record_id}"), || {
                self.store.delete(record_id.clone())
            })
            .await;
        match result {
            Ok(()) => log::debug!("Deleted {record_id}"),
            Err(RemoteError::NotFound(_)) => log::debug!("{record_id} was already gone"),
            Err(e) => log::warn!("Remote delete of {record_id} failed: {e}"),
        }
        drop(permit);
    }

    async fn reconcile_order(self: Arc<Self>) {
        let _serial = self.reorder_serial.lock().await;
        for round in 1..=RECONCILE_ROUNDS {
            let order = self.lock().bound_order();
            let wait = if round == 1 {
                self.config.guard_wait()
            } else {
                self.config.guard_timeout()
            };
            let result =
                reorder::reconcile(self.store.as_ref(), &self.guard, &order, wait).await;
            match result {
                Ok(report) => {
                    let deferred = report.deferred.len();
                    self.handle_report(report);
                    if deferred == 0 {
                        return;
                    }
                    log::info!("{deferred} records were busy during reorder round {round}");
                }
                Err(e) => {
                    log::warn!("Reordering {} records failed: {e}", order.len());
                    self.report_failure(None, e);
                    return;
                }
            }
        }
        log::warn!("Sort indices still incomplete after {RECONCILE_ROUNDS} rounds");
    }

    fn handle_report(&self, report: ReconcileReport) {
        for record_id in &report.missing {
            log::debug!("{record_id} vanished before it could be reordered");
        }
        for (record_id, error) in report.failed {
            let id = self.lock().id_for_record(&record_id);
            self.report_failure(id, error);
        }
    }
}
