//! Per-workout fetch rate limiting with a short-lived cache of the last good result.
//!
//! The cache exists to mask the window right after a write, where the remote query can
//! come back empty for a workout that plainly has exercises. Showing the last non-empty
//! result is preferred over flashing an empty list.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ThrottleConfig;
use crate::error::RemoteError;
use crate::model::{ExerciseRecord, RecordId, WorkoutRef};
use crate::remote::{Predicate, RemoteStore, SortOrder};

#[derive(Clone, Debug, PartialEq)]
pub enum FetchDecision {
    /// Too soon to fetch again; here is the last non-empty result instead.
    SkipWithCache(Vec<ExerciseRecord>),
    /// Too soon to fetch again and there is nothing cached.
    SkipEmpty,
    Proceed,
}

struct ThrottleEntry {
    last_fetch: Instant,
    last_count: usize,
    cached: Option<CachedResult>,
}

struct CachedResult {
    records: Vec<ExerciseRecord>,
    stored_at: Instant,
}

pub struct FetchThrottle {
    config: ThrottleConfig,
    entries: HashMap<WorkoutRef, ThrottleEntry>,
}

impl FetchThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn should_fetch(&self, workout: &WorkoutRef, force_refresh: bool) -> FetchDecision {
        if force_refresh {
            return FetchDecision::Proceed;
        }
        let Some(entry) = self.entries.get(workout) else {
            return FetchDecision::Proceed;
        };

        let interval = if entry.last_count > 0 {
            self.config.nonempty_interval()
        } else {
            self.config.interval()
        };
        if entry.last_fetch.elapsed() >= interval {
            return FetchDecision::Proceed;
        }

        match self.fresh_cache(entry) {
            Some(records) => FetchDecision::SkipWithCache(records.to_vec()),
            None => FetchDecision::SkipEmpty,
        }
    }

    /// Record a completed fetch. Only non-empty results replace the cached set.
    pub fn record_fetch(&mut self, workout: &WorkoutRef, records: &[ExerciseRecord]) {
        let now = Instant::now();
        let entry = self
            .entries
            .entry(workout.clone())
            .or_insert_with(|| ThrottleEntry {
                last_fetch: now,
                last_count: 0,
                cached: None,
            });
        entry.last_fetch = now;
        entry.last_count = records.len();
        if !records.is_empty() {
            entry.cached = Some(CachedResult {
                records: records.to_vec(),
                stored_at: now,
            });
        }
    }

    /// Whether the workout previously had a non-empty result, which makes an empty one suspicious.
    pub fn expects_results(&self, workout: &WorkoutRef) -> bool {
        self.entries
            .get(workout)
            .and_then(|entry| entry.cached.as_ref())
            .is_some_and(|cached| !cached.records.is_empty())
    }

    pub fn cached(&self, workout: &WorkoutRef) -> Option<Vec<ExerciseRecord>> {
        let entry = self.entries.get(workout)?;
        self.fresh_cache(entry).map(<[ExerciseRecord]>::to_vec)
    }

    /// Drop a deleted record from the cached set so a throttled load can't resurrect it.
    pub fn forget_record(&mut self, workout: &WorkoutRef, id: &RecordId) {
        let Some(entry) = self.entries.get_mut(workout) else {
            return;
        };
        if let Some(cached) = entry.cached.as_mut() {
            cached.records.retain(|record| record.id.as_ref() != Some(id));
            if cached.records.is_empty() {
                entry.cached = None;
            }
        }
    }

    pub fn clear(&mut self, workout: &WorkoutRef) {
        self.entries.remove(workout);
    }

    fn fresh_cache<'a>(&self, entry: &'a ThrottleEntry) -> Option<&'a [ExerciseRecord]> {
        entry
            .cached
            .as_ref()
            .filter(|cached| cached.stored_at.elapsed() < self.config.cache_ttl())
            .map(|cached| cached.records.as_slice())
    }
}

/// Query a workout's exercises, retrying transient failures and suspicious empty results.
///
/// An empty result is only retried when `expects_results` is set; once the attempts are
/// used up it is returned as-is.
pub async fn fetch_with_retry(
    store: &dyn RemoteStore,
    workout: &WorkoutRef,
    attempts: u32,
    backoff: Duration,
    expects_results: bool,
) -> Result<Vec<ExerciseRecord>, RemoteError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = store
            .fetch_by_query(
                Predicate::Workout(workout.clone()),
                SortOrder::SortIndexAscending,
            )
            .await;

        let retry = match &result {
            Ok(records) => records.is_empty() && expects_results,
            Err(e) => e.is_transient(),
        };
        if !retry || attempt >= attempts {
            return result;
        }

        match &result {
            Ok(_) => log::debug!(
                "Workout {workout} came back empty on attempt {attempt}/{attempts}, retrying"
            ),
            Err(e) => log::warn!(
                "Fetching workout {workout} failed on attempt {attempt}/{attempts}: {e}, retrying"
            ),
        }
        attempt += 1;
        tokio::time::sleep(backoff).await;
    }
}
