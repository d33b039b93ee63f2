use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::Field;

/// Timing knobs for the sync engine. All durations are milliseconds on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a write token lives before it is reclaimed.
    pub guard_timeout_ms: u64,
    /// How long a writer waits for a busy record before deferring.
    pub guard_wait_ms: u64,
    pub throttle: ThrottleConfig,
    pub debounce: DebounceConfig,
    /// Quiet window that lets rapid checkbox taps collapse into one write.
    pub completion_coalesce_ms: u64,
    pub write_retry_attempts: u32,
    pub write_retry_backoff_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub interval_ms: u64,
    /// Interval used when the previous fetch for the group returned results.
    pub nonempty_interval_ms: u64,
    pub cache_ttl_ms: u64,
    pub fetch_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub name_ms: u64,
    pub note_ms: u64,
    pub counts_ms: u64,
    pub weights_ms: u64,
    pub actual_reps_ms: u64,
    pub set_notes_ms: u64,
    pub accent_color_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            guard_timeout_ms: 5_000,
            guard_wait_ms: 5_000,
            throttle: ThrottleConfig::default(),
            debounce: DebounceConfig::default(),
            completion_coalesce_ms: 250,
            write_retry_attempts: 2,
            write_retry_backoff_ms: 1_000,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            nonempty_interval_ms: 500,
            cache_ttl_ms: 30_000,
            fetch_attempts: 2,
            retry_backoff_ms: 1_000,
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            name_ms: 1_000,
            note_ms: 1_500,
            counts_ms: 500,
            weights_ms: 1_000,
            actual_reps_ms: 1_000,
            set_notes_ms: 1_000,
            accent_color_ms: 500,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).inspect_err(|e| {
            log::error!("Could not read config {}: {e}", path.display());
        })?;
        Self::from_json_str(&contents)
    }

    pub fn guard_timeout(&self) -> Duration {
        Duration::from_millis(self.guard_timeout_ms)
    }

    pub fn guard_wait(&self) -> Duration {
        Duration::from_millis(self.guard_wait_ms)
    }

    pub fn completion_coalesce(&self) -> Duration {
        Duration::from_millis(self.completion_coalesce_ms)
    }

    pub fn write_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.write_retry_backoff_ms)
    }
}

impl ThrottleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn nonempty_interval(&self) -> Duration {
        Duration::from_millis(self.nonempty_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl DebounceConfig {
    pub fn quiet_period(&self, field: Field) -> Duration {
        let ms = match field {
            Field::Name => self.name_ms,
            Field::Note => self.note_ms,
            Field::Sets | Field::Reps => self.counts_ms,
            Field::Weights => self.weights_ms,
            Field::ActualReps => self.actual_reps_ms,
            Field::SetNotes => self.set_notes_ms,
            Field::AccentColor => self.accent_color_ms,
            // not debounced; see CompletionMerger
            Field::Completions => 0,
        };
        Duration::from_millis(ms)
    }
}
