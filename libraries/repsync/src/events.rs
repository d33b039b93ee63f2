//! Change notification for cache observers.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use slotmap::SlotMap;

use crate::error::RemoteError;
use crate::model::{ExerciseId, Field, RecordId, WorkoutRef};

slotmap::new_key_type! {
    pub struct ListenerKey;
}

/// `state` only moves when the cached content changed; `refresh` moves on every mutating
/// operation, so observers can tell "unchanged" from "changed to the same content".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CacheVersion {
    pub state: u64,
    pub refresh: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEvent {
    pub version: CacheVersion,
    pub kind: CacheEventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheEventKind {
    Loaded {
        workout: WorkoutRef,
        count: usize,
        changed: bool,
    },
    Inserted(ExerciseId),
    Bound {
        id: ExerciseId,
        record_id: RecordId,
    },
    Updated {
        id: ExerciseId,
        fields: Vec<Field>,
    },
    CompletionsCommitted(ExerciseId),
    Removed(ExerciseId),
    Reordered,
    /// The session ended and the list was emptied.
    Cleared,
    SyncFailed {
        id: Option<ExerciseId>,
        error: RemoteError,
    },
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
pub struct Listeners {
    listeners: Mutex<SlotMap<ListenerKey, Listener>>,
}

impl Listeners {
    pub fn register(&self, listener: impl Fn(&CacheEvent) + Send + Sync + 'static) -> ListenerKey {
        self.lock().insert(Arc::new(listener))
    }

    pub fn unregister(&self, key: ListenerKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Call every listener with `event`. The registry lock is not held while calling,
    /// so a listener may subscribe or unsubscribe.
    pub fn emit(&self, event: &CacheEvent) {
        let listeners: Vec<Listener> = self.lock().values().cloned().collect();
        for listener in &listeners {
            listener(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotMap<ListenerKey, Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
