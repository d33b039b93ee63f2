use crate::model::{ExerciseId, RecordId, WorkoutRef};

/// Failure reported by a [`crate::RemoteStore`] call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("remote call timed out")]
    Timeout,
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Transient failures are worth retrying; the rest will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no exercise {0} in the cache")]
    UnknownExercise(ExerciseId),
    #[error("set index {index} out of range for an exercise with {sets} sets")]
    SetIndexOutOfRange { index: usize, sets: usize },
    #[error("no workout loaded")]
    NoActiveWorkout,
    #[error("fetching workout {workout} failed: {source}")]
    Fetch {
        workout: WorkoutRef,
        #[source]
        source: RemoteError,
    },
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
