use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use repsync::memory::{MemoryStore, Op};
use repsync::{
    CacheEventKind, ExerciseCache, ExerciseData, ExerciseRecord, FieldDelta, RemoteStore,
    SyncConfig, WorkoutRef,
};

/// Drive a scripted editing session against an in-memory store and report what was sent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON file with sync settings; defaults are used for anything it leaves out
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated latency of every remote call, in milliseconds
    #[arg(short, long, default_value_t = 300)]
    latency_ms: u64,

    /// Number of exercises the workout starts with
    #[arg(short, long, default_value_t = 3)]
    exercises: usize,

    /// Number of rapid edits typed into the first exercise's reps
    #[arg(long, default_value_t = 10)]
    keystrokes: u32,

    /// Print the final list as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SyncConfig::from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let workout = WorkoutRef::new("scope-workout");
    let store = Arc::new(MemoryStore::new());
    for i in 0..args.exercises {
        store.insert(ExerciseRecord {
            id: None,
            workout: workout.clone(),
            data: ExerciseData::new(format!("Exercise {}", i + 1), 3, 10).with_sort_index(i),
        });
    }
    store.set_latency_all(Duration::from_millis(args.latency_ms));

    let remote: Arc<dyn RemoteStore> = store.clone();
    let cache = ExerciseCache::new(remote, config);
    cache.subscribe(|event| match &event.kind {
        CacheEventKind::SyncFailed { id, error } => {
            log::warn!("sync failed for {id:?}: {error} (v{})", event.version.state)
        }
        kind => log::info!("{kind:?} (v{}/{})", event.version.state, event.version.refresh),
    });

    cache
        .load(workout.clone(), true)
        .await
        .context("Initial load failed")?;
    println!("Loaded {} exercises", cache.len());

    let squats = cache.add(ExerciseData::new("Squats", 3, 5))?;
    println!("Added Squats, list now has {} exercises", cache.len());

    if let Some(first) = cache.exercises().first().map(|e| e.id()) {
        for reps in 1..=args.keystrokes {
            cache.update(first, vec![FieldDelta::Reps(reps)])?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cache.toggle_completion(first, 1)?;
        cache.toggle_completion(first, 1)?;
        cache.toggle_completion(first, 0)?;
    }
    cache.update(
        squats,
        vec![
            FieldDelta::Sets(4),
            FieldDelta::Weight {
                set: 3,
                value: 100.0,
            },
        ],
    )?;
    cache.reorder(squats, 0)?;
    if let Some(second) = cache.exercises().get(1).map(|e| e.id()) {
        cache.delete(second)?;
    }

    cache.wait_idle().await;
    cache.load(workout.clone(), true).await?;

    println!();
    println!("Final list:");
    println!("-----------");
    for exercise in cache.exercises() {
        let data = exercise.data();
        println!(
            "  {:>2}. {} ({} x {}) record={} completions={:?} weights={:?}",
            data.sort_index(),
            data.name(),
            data.sets(),
            data.reps(),
            exercise
                .record_id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "<local>".to_string()),
            data.set_completions(),
            data.set_weights(),
        );
    }

    let stats = store.stats();
    println!();
    println!("Remote calls:");
    println!("-------------");
    for op in [
        Op::FetchById,
        Op::FetchByQuery,
        Op::Save,
        Op::SaveBatch,
        Op::Delete,
    ] {
        println!("  {op:?}: {}", stats.calls(op));
    }
    let worst = stats.max_in_flight.values().copied().max().unwrap_or(0);
    println!("  Most concurrent writes to one record: {worst}");
    println!("  Guard timeouts: {}", cache.guard().timed_out_count());

    let version = cache.version();
    println!();
    println!("Version: state {} refresh {}", version.state, version.refresh);
    if let Some(error) = cache.last_error() {
        println!("Last error: {error}");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&cache.exercises())?);
    }

    cache.teardown().await;
    Ok(())
}
