//! An optimistic, instantly editable cache of workout exercises kept in sync with a slow,
//! eventually consistent remote record store.
//!
//! Sync strategy:
//! 1. Every edit is applied to the local list first, so readers see it immediately.
//! 2. The outbound write depends on the shape of the edit:
//!   1. Field edits (name, reps, weights, ...) wait for a quiet period per field, and only the last value is sent.
//!   2. Completion checkboxes go into a pending overlay that readers prefer, and one serialized write queue per exercise sends the settled snapshot.
//!   3. Reorders renumber the list locally and persist every sort index in one batch.
//! 3. At most one write per remote record is ever on the wire. A write that finds its record busy is deferred, never interleaved.
//! 4. Reads are throttled per workout, retried when a suspiciously empty result comes back, and a fetch that was overtaken by a newer one is discarded.
//!
//! The remote store is anything implementing [`RemoteStore`]; [`MemoryStore`] is an
//! in-process one with injectable latency and failures.

pub mod cache;
pub mod completion;
pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod memory;
pub mod model;
pub mod remote;
pub mod reorder;
pub mod throttle;

pub use cache::ExerciseCache;
pub use chokepoint::ChokePoint;
pub use config::SyncConfig;
pub use error::{RemoteError, SyncError};
pub use events::{CacheEvent, CacheEventKind, CacheVersion, ListenerKey};
pub use memory::MemoryStore;
pub use model::{
    Exercise, ExerciseData, ExerciseId, ExerciseRecord, Field, FieldDelta, RecordId, WorkoutRef,
};
pub use remote::{Predicate, RemoteStore, SortOrder};
