use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use repsync::memory::{MemoryStore, Op};
use repsync::{
    CacheEventKind, ExerciseCache, ExerciseData, ExerciseRecord, FieldDelta, RecordId,
    RemoteError, RemoteStore, SyncConfig, SyncError, WorkoutRef,
};

fn workout() -> WorkoutRef {
    WorkoutRef::new("w-1")
}

fn seed(store: &MemoryStore, names: &[&str]) -> Vec<RecordId> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            store.insert(ExerciseRecord {
                id: None,
                workout: workout(),
                data: ExerciseData::new(*name, 3, 10).with_sort_index(i),
            })
        })
        .collect()
}

fn new_cache(store: &Arc<MemoryStore>) -> ExerciseCache {
    let remote: Arc<dyn RemoteStore> = store.clone();
    ExerciseCache::new(remote, SyncConfig::default())
}

async fn loaded(names: &[&str]) -> (Arc<MemoryStore>, ExerciseCache, Vec<RecordId>) {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, names);
    let cache = new_cache(&store);
    cache.load(workout(), true).await.unwrap();
    (store, cache, ids)
}

fn id_of(cache: &ExerciseCache, record_id: &RecordId) -> repsync::ExerciseId {
    cache
        .exercises()
        .iter()
        .find(|e| e.record_id() == Some(record_id))
        .map(|e| e.id())
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_set_count_changes_keep_arrays_aligned() {
    let (store, cache, ids) = loaded(&["Bench"]).await;
    let id = id_of(&cache, &ids[0]);

    for sets in [5, 0, 1, 4, 2] {
        cache.update(id, vec![FieldDelta::Sets(sets)]).unwrap();
        let exercise = cache.exercise(id).unwrap();
        assert_eq!(exercise.data().sets(), sets);
        assert!(exercise.data().arrays_consistent());
    }
    cache.toggle_completion(id, 1).unwrap();
    cache.update(id, vec![FieldDelta::Sets(1)]).unwrap();
    assert_eq!(cache.display_completions(id).unwrap().len(), 1);

    cache.wait_idle().await;
    let record = store.get(&ids[0]).unwrap();
    assert_eq!(record.data.sets(), 1);
    assert!(record.data.arrays_consistent());
}

#[tokio::test(start_paused = true)]
async fn test_one_write_per_record_in_flight() {
    let (store, cache, ids) = loaded(&["Squat"]).await;
    let id = id_of(&cache, &ids[0]);
    store.set_latency(Op::Save, Duration::from_secs(1));

    cache.update(id, vec![FieldDelta::Reps(12)]).unwrap();
    cache
        .update(id, vec![FieldDelta::Name("Paused Squat".into())])
        .unwrap();
    cache.toggle_completion(id, 0).unwrap();

    // the reps write is outbound; the name and completion writes must wait for it
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(store.stats().writes(&ids[0]), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let stats = store.stats();
    assert_eq!(stats.max_in_flight(&ids[0]), 1);
    assert_eq!(stats.writes(&ids[0]), 3);

    let record = store.get(&ids[0]).unwrap();
    assert_eq!(record.data.reps(), 12);
    assert_eq!(record.data.name(), "Paused Squat");
    assert_eq!(record.data.set_completions(), &[true, false, false]);
    assert!(cache.guard().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rapid_edits_collapse_into_one_write() {
    let (store, cache, ids) = loaded(&["Row"]).await;
    let id = id_of(&cache, &ids[0]);

    for reps in 1..=10 {
        cache.update(id, vec![FieldDelta::Reps(reps)]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(store.stats().writes(&ids[0]), 0);
    assert_eq!(cache.exercise(id).unwrap().data().reps(), 10);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.stats().writes(&ids[0]), 1);
    assert_eq!(store.get(&ids[0]).unwrap().data.reps(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_per_set_edits_are_sent_together() {
    let (store, cache, ids) = loaded(&["Press"]).await;
    let id = id_of(&cache, &ids[0]);

    cache
        .update(id, vec![FieldDelta::Weight { set: 0, value: 40.0 }])
        .unwrap();
    cache
        .update(id, vec![FieldDelta::Weight { set: 2, value: 45.0 }])
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(store.stats().writes(&ids[0]), 1);
    assert_eq!(
        store.get(&ids[0]).unwrap().data.set_weights(),
        &[40.0, 0.0, 45.0]
    );
}

#[tokio::test(start_paused = true)]
async fn test_toggles_during_write_compose() {
    let (store, cache, ids) = loaded(&["Deadlift"]).await;
    let id = id_of(&cache, &ids[0]);
    store.set_latency(Op::Save, Duration::from_millis(300));

    assert_eq!(cache.toggle_completion(id, 0).unwrap(), vec![true, false, false]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.toggle_completion(id, 2).unwrap(), vec![true, false, true]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let committed = cache.committed(id).unwrap();
    assert_eq!(committed.data().set_completions(), &[true, false, true]);
    assert_eq!(
        store.get(&ids[0]).unwrap().data.set_completions(),
        &[true, false, true]
    );
    assert_eq!(store.stats().max_in_flight(&ids[0]), 1);
}

#[tokio::test(start_paused = true)]
async fn test_double_toggle_sends_one_write_with_settled_value() {
    let (store, cache, ids) = loaded(&["Curl"]).await;
    let id = id_of(&cache, &ids[0]);
    let original = cache.exercise(id).unwrap().data().set_completions().to_vec();

    cache.toggle_completion(id, 1).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    let shown = cache.toggle_completion(id, 1).unwrap();
    assert_eq!(shown, original);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.stats().writes(&ids[0]), 1);
    let written = store.saved().pop().unwrap();
    assert_eq!(written.data.set_completions(), original.as_slice());
    assert_eq!(
        cache.committed(id).unwrap().data().set_completions(),
        original.as_slice()
    );
}

#[tokio::test(start_paused = true)]
async fn test_reorders_leave_dense_sort_indices() {
    let (store, cache, _) = loaded(&["a", "b", "c", "d", "e"]).await;
    let by_name = |name: &str| {
        cache
            .exercises()
            .iter()
            .find(|e| e.data().name() == name)
            .map(|e| e.id())
            .unwrap()
    };

    cache.reorder(by_name("e"), 0).unwrap();
    cache.reorder(by_name("a"), 2).unwrap();
    cache.reorder(by_name("c"), 99).unwrap();
    cache.wait_idle().await;

    let local: Vec<(String, usize)> = cache
        .exercises()
        .iter()
        .map(|e| (e.data().name().to_string(), e.data().sort_index()))
        .collect();
    let remote: Vec<(String, usize)> = store
        .records_for(&workout())
        .iter()
        .map(|r| (r.data.name().to_string(), r.data.sort_index()))
        .collect();

    let names: Vec<&str> = local.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["e", "b", "a", "d", "c"]);
    assert_eq!(local, remote);
    let indices: BTreeSet<usize> = remote.iter().map(|(_, index)| *index).collect();
    assert_eq!(indices, (0..5).collect());
}

#[tokio::test(start_paused = true)]
async fn test_partial_reorder_failure_keeps_local_order() {
    let (store, cache, ids) = loaded(&["a", "b", "c"]).await;
    store.reject_in_batch(ids[1].clone());

    let c = id_of(&cache, &ids[2]);
    cache.reorder(c, 0).unwrap();
    cache.wait_idle().await;

    let names: Vec<String> = cache
        .exercises()
        .iter()
        .map(|e| e.data().name().to_string())
        .collect();
    assert_eq!(names, vec!["c", "a", "b"]);
    assert!(matches!(cache.last_error(), Some(RemoteError::Rejected(_))));
    assert_eq!(store.get(&ids[2]).unwrap().data.sort_index(), 0);
    assert_eq!(store.get(&ids[0]).unwrap().data.sort_index(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_overtaken_fetch_is_discarded() {
    let (store, cache, _) = loaded(&["Old"]).await;
    store.set_latency(Op::FetchByQuery, Duration::from_secs(2));

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.load(workout(), true).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    seed(&store, &["New"]);
    store.set_latency(Op::FetchByQuery, Duration::from_millis(100));
    assert!(cache.load(workout(), true).await.unwrap());
    assert_eq!(cache.len(), 2);

    assert!(!slow.await.unwrap().unwrap());
    assert_eq!(cache.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_add_binds_remote_identifier() {
    let store = Arc::new(MemoryStore::new());
    store.set_latency(Op::Save, Duration::from_millis(500));
    let cache = new_cache(&store);
    cache.load(workout(), true).await.unwrap();

    let id = cache.add(ExerciseData::new("Squats", 3, 0)).unwrap();
    assert_eq!(cache.len(), 1);
    let pending = cache.exercise(id).unwrap();
    assert!(pending.temp_id().is_some());
    assert!(pending.record_id().is_none());
    assert_eq!(pending.data().set_weights(), &[0.0, 0.0, 0.0]);
    assert_eq!(pending.data().set_completions(), &[false, false, false]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let bound = cache.exercise(id).unwrap();
    assert_eq!(cache.len(), 1);
    assert!(bound.temp_id().is_none());
    let record_id = bound.record_id().cloned().unwrap();
    let record = store.get(&record_id).unwrap();
    assert_eq!(record.data.name(), "Squats");
    assert_eq!(record.data.sets(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_added_exercises_go_last() {
    let (store, cache, _) = loaded(&["a", "b"]).await;
    let first = cache.add(ExerciseData::new("c", 3, 8)).unwrap();
    let second = cache.add(ExerciseData::new("d", 3, 8)).unwrap();
    assert_eq!(cache.exercise(first).unwrap().data().sort_index(), 2);
    assert_eq!(cache.exercise(second).unwrap().data().sort_index(), 3);

    cache.wait_idle().await;
    assert_eq!(store.records_for(&workout()).len(), 4);
    // a refetch keeps the identities of bound exercises
    cache.load(workout(), true).await.unwrap();
    assert!(cache.exercise(first).is_some());
    assert!(cache.exercise(second).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_delete_is_immediate_and_not_resurrected() {
    let (store, cache, ids) = loaded(&["a", "b"]).await;
    store.set_latency(Op::Delete, Duration::from_secs(2));
    let a = id_of(&cache, &ids[0]);

    cache.update(a, vec![FieldDelta::Note("skip".into())]).unwrap();
    cache.delete(a).unwrap();
    assert_eq!(cache.len(), 1);
    assert!(matches!(cache.delete(a), Err(SyncError::UnknownExercise(_))));

    // the remote delete is still outbound
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get(&ids[0]).is_some());
    cache.load(workout(), true).await.unwrap();
    assert_eq!(cache.len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(store.get(&ids[0]).is_none());
    // the cancelled note edit never went out
    assert_eq!(store.stats().calls(Op::Save), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_before_first_save_removes_orphan() {
    let store = Arc::new(MemoryStore::new());
    store.set_latency(Op::Save, Duration::from_secs(1));
    let cache = new_cache(&store);
    cache.load(workout(), true).await.unwrap();

    let id = cache.add(ExerciseData::new("Lunge", 2, 10)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.delete(id).unwrap();
    assert!(cache.is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(store.is_empty());
    assert_eq!(store.stats().calls(Op::Delete), 1);
}

#[tokio::test(start_paused = true)]
async fn test_edit_of_remotely_deleted_record_is_abandoned() {
    let (store, cache, ids) = loaded(&["Dip"]).await;
    let id = id_of(&cache, &ids[0]);
    store.remove(&ids[0]);

    cache.update(id, vec![FieldDelta::Name("Ring Dip".into())]).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(store.is_empty());
    assert_eq!(cache.exercise(id).unwrap().data().name(), "Ring Dip");
    assert_eq!(cache.last_error(), None);
    assert!(cache.guard().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_write_failure_is_retried() {
    let (store, cache, ids) = loaded(&["Pull-up"]).await;
    let id = id_of(&cache, &ids[0]);
    store.fail_next(Op::Save, RemoteError::Network("connection reset".into()));

    cache.update(id, vec![FieldDelta::Reps(6)]).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(store.get(&ids[0]).unwrap().data.reps(), 6);
    assert_eq!(cache.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_write_retries_set_error_flag() {
    let (store, cache, ids) = loaded(&["Pull-up"]).await;
    let id = id_of(&cache, &ids[0]);
    for _ in 0..3 {
        store.fail_next(Op::Save, RemoteError::Timeout);
    }
    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = Arc::clone(&failures);
        cache.subscribe(move |event| {
            if let CacheEventKind::SyncFailed { id, error } = &event.kind {
                failures.lock().unwrap().push((*id, error.clone()));
            }
        });
    }

    cache.update(id, vec![FieldDelta::Reps(6)]).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(cache.last_error(), Some(RemoteError::Timeout));
    assert_eq!(*failures.lock().unwrap(), vec![(Some(id), RemoteError::Timeout)]);
    // local state is kept
    assert_eq!(cache.exercise(id).unwrap().data().reps(), 6);
    assert_eq!(store.get(&ids[0]).unwrap().data.reps(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_only_surfaces_before_first_load() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &["a"]);
    let cache = new_cache(&store);
    for _ in 0..2 {
        store.fail_next(Op::FetchByQuery, RemoteError::Network("offline".into()));
    }
    let err = cache.load(workout(), true).await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch { .. }));

    assert!(cache.load(workout(), true).await.unwrap());
    for _ in 0..2 {
        store.fail_next(Op::FetchByQuery, RemoteError::Network("offline".into()));
    }
    assert!(!cache.load(workout(), true).await.unwrap());
    assert_eq!(cache.len(), 1);
    assert!(matches!(cache.last_error(), Some(RemoteError::Network(_))));
}

#[tokio::test(start_paused = true)]
async fn test_loads_are_throttled() {
    let (store, cache, _) = loaded(&["a"]).await;
    assert_eq!(store.stats().calls(Op::FetchByQuery), 1);

    assert!(!cache.load(workout(), false).await.unwrap());
    assert_eq!(store.stats().calls(Op::FetchByQuery), 1);
    assert_eq!(cache.len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    cache.load(workout(), false).await.unwrap();
    assert_eq!(store.stats().calls(Op::FetchByQuery), 2);
}

fn names(cache: &ExerciseCache) -> Vec<String> {
    cache
        .exercises()
        .iter()
        .map(|e| e.data().name().to_string())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_throttled_reload_keeps_reordered_list() {
    let (store, cache, ids) = loaded(&["a", "b", "c"]).await;
    let c = id_of(&cache, &ids[2]);

    cache.reorder(c, 0).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!cache.load(workout(), false).await.unwrap());
    assert_eq!(names(&cache), vec!["c", "a", "b"]);

    cache.wait_idle().await;
    let remote: Vec<String> = store
        .records_for(&workout())
        .iter()
        .map(|r| r.data.name().to_string())
        .collect();
    assert_eq!(remote, names(&cache));
}

#[tokio::test(start_paused = true)]
async fn test_throttled_reload_keeps_committed_completions() {
    let (store, cache, ids) = loaded(&["Bench"]).await;
    let id = id_of(&cache, &ids[0]);

    cache.toggle_completion(id, 0).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        store.get(&ids[0]).unwrap().data.set_completions(),
        &[true, false, false]
    );

    assert!(!cache.load(workout(), false).await.unwrap());
    assert_eq!(
        cache.committed(id).unwrap().data().set_completions(),
        &[true, false, false]
    );
}

#[tokio::test(start_paused = true)]
async fn test_forced_reload_during_field_write_keeps_edit() {
    let (store, cache, ids) = loaded(&["Bench"]).await;
    store.set_latency(Op::Save, Duration::from_secs(2));
    let id = id_of(&cache, &ids[0]);

    cache
        .update(id, vec![FieldDelta::Name("Incline".into())])
        .unwrap();
    // the quiet period has passed and the save is outbound
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    cache.load(workout(), true).await.unwrap();
    assert_eq!(cache.exercise(id).unwrap().data().name(), "Incline");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(cache.exercise(id).unwrap().data().name(), "Incline");
    assert_eq!(store.get(&ids[0]).unwrap().data.name(), "Incline");
}

#[tokio::test(start_paused = true)]
async fn test_fetch_issued_before_write_landed_keeps_edit() {
    let (store, cache, ids) = loaded(&["Bench"]).await;
    store.set_latency(Op::Save, Duration::from_millis(500));
    store.set_latency(Op::FetchByQuery, Duration::from_secs(2));
    let id = id_of(&cache, &ids[0]);

    cache
        .update(id, vec![FieldDelta::Name("Incline".into())])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    // snapshot taken before the save lands, result delivered after it
    cache.load(workout(), true).await.unwrap();
    assert_eq!(store.get(&ids[0]).unwrap().data.name(), "Incline");
    assert_eq!(cache.exercise(id).unwrap().data().name(), "Incline");

    // a fetch issued after the write needs no help
    cache.load(workout(), true).await.unwrap();
    assert_eq!(cache.exercise(id).unwrap().data().name(), "Incline");
}

#[tokio::test(start_paused = true)]
async fn test_flush_pending_skips_quiet_period() {
    let (store, cache, ids) = loaded(&["Plank"]).await;
    let id = id_of(&cache, &ids[0]);

    cache
        .update(id, vec![FieldDelta::Note("hold 60s".into())])
        .unwrap();
    cache.flush_pending().await;
    assert_eq!(store.get(&ids[0]).unwrap().data.note(), "hold 60s");
    assert!(!cache.has_pending_writes());
}

#[tokio::test(start_paused = true)]
async fn test_listeners_see_every_mutation() {
    let store = Arc::new(MemoryStore::new());
    let cache = new_cache(&store);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let key = {
        let seen = Arc::clone(&seen);
        cache.subscribe(move |event| seen.lock().unwrap().push(event.clone()))
    };

    cache.load(workout(), true).await.unwrap();
    let id = cache.add(ExerciseData::new("Squats", 3, 5)).unwrap();
    cache.wait_idle().await;
    cache.delete(id).unwrap();
    assert!(cache.unsubscribe(key));
    cache.load(workout(), true).await.unwrap();

    let seen = seen.lock().unwrap();
    let kinds: Vec<&CacheEventKind> = seen.iter().map(|event| &event.kind).collect();
    assert!(matches!(kinds[0], CacheEventKind::Loaded { count: 0, .. }));
    assert_eq!(kinds[1], &CacheEventKind::Inserted(id));
    assert!(matches!(kinds[2], CacheEventKind::Bound { id: bound, .. } if *bound == id));
    assert_eq!(kinds.last(), Some(&&CacheEventKind::Removed(id)));
    assert!(seen.windows(2).all(|w| w[0].version.refresh < w[1].version.refresh));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_flushes_then_clears() {
    let (store, cache, ids) = loaded(&["Squat", "Bench"]).await;
    let id = id_of(&cache, &ids[1]);

    cache.update(id, vec![FieldDelta::Reps(3)]).unwrap();
    cache.teardown().await;

    assert_eq!(store.get(&ids[1]).unwrap().data.reps(), 3);
    assert!(cache.is_empty());
    assert_eq!(cache.active_workout(), None);
    assert!(cache.guard().is_empty());
}
