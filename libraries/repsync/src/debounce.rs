//! Accumulate edits per key and flush the latest one after a quiet period.
//!
//! Use one [`Debouncer`] per edited field: two fields sharing an instance would cancel
//! each other's pending writes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

/// What a flush callback did with the value it was handed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Sent, or deliberately dropped. Either way the debouncer is done with it.
    Done,
    /// Couldn't send yet (write in flight, record not bound). Try again one quiet period later.
    Deferred,
}

pub type FlushFn<V> = Arc<dyn Fn(V) -> BoxFuture<'static, FlushOutcome> + Send + Sync>;

// Beyond this a deferred value is dropped; the local state still holds it.
const MAX_DEFERRALS: u32 = 40;

pub struct Debouncer<K, V> {
    inner: Arc<Inner<K, V>>,
}

struct Inner<K, V> {
    quiet: Duration,
    pending: Mutex<HashMap<K, Pending<V>>>,
    next_generation: AtomicU64,
}

struct Pending<V> {
    value: V,
    generation: u64,
    deferrals: u32,
    flush: FlushFn<V>,
    timer: Option<JoinHandle<()>>,
}

impl<V> Pending<V> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl<K, V> Clone for Debouncer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Debouncer<K, V>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(quiet: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                quiet,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet
    }

    /// Replace whatever is pending for `key` with `value` and restart the quiet period.
    pub fn schedule(&self, key: K, value: V, flush: FlushFn<V>) {
        self.schedule_inner(key, value, flush, 0);
    }

    pub fn pending_value(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).map(|pending| pending.value.clone())
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Flush `key` right away, bypassing its timer. `None` if nothing was pending.
    pub async fn flush_now(&self, key: &K) -> Option<FlushOutcome> {
        let mut pending = self.inner.lock().remove(key)?;
        pending.cancel_timer();
        Some(Inner::run(&self.inner, key.clone(), pending).await)
    }

    /// Flush every pending key, as on focus loss or view teardown.
    pub async fn flush_all(&self) {
        let keys: Vec<K> = self.inner.lock().keys().cloned().collect();
        let flushes = keys.iter().map(|key| self.flush_now(key));
        futures::future::join_all(flushes).await;
    }

    /// Drop the pending value for `key` without sending it.
    pub fn cancel(&self, key: &K) -> Option<V> {
        let mut pending = self.inner.lock().remove(key)?;
        pending.cancel_timer();
        Some(pending.value)
    }

    pub fn cancel_all(&self) {
        let drained: Vec<Pending<V>> = self.inner.lock().drain().map(|(_, p)| p).collect();
        for mut pending in drained {
            pending.cancel_timer();
        }
    }

    fn schedule_inner(&self, key: K, value: V, flush: FlushFn<V>, deferrals: u32) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.inner.lock().insert(
            key.clone(),
            Pending {
                value,
                generation,
                deferrals,
                flush,
                timer: None,
            },
        );
        if let Some(mut previous) = previous {
            previous.cancel_timer();
        }

        // The timer may already have fired and be running the flush; never abort it from here.
        if let Some(timer) = self.spawn_timer(key.clone(), generation) {
            let mut map = self.inner.lock();
            if let Some(pending) = map.get_mut(&key).filter(|p| p.generation == generation) {
                pending.timer = Some(timer);
            }
        }
    }

    fn spawn_timer(&self, key: K, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime available, edit for {key:?} stays pending until flushed");
            return None;
        };
        let inner: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        let quiet = self.inner.quiet;
        Some(handle.spawn(async move {
            tokio::time::sleep(quiet).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let pending = {
                let mut map = inner.lock();
                match map.get(&key) {
                    Some(pending) if pending.generation == generation => map.remove(&key),
                    _ => None,
                }
            };
            if let Some(pending) = pending {
                Inner::run(&inner, key, pending).await;
            }
        }))
    }
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Pending<V>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(inner: &Arc<Self>, key: K, pending: Pending<V>) -> FlushOutcome {
        let Pending {
            value,
            deferrals,
            flush,
            ..
        } = pending;
        let outcome = flush(value.clone()).await;
        if outcome == FlushOutcome::Deferred {
            let debouncer = Debouncer {
                inner: Arc::clone(inner),
            };
            if debouncer.is_pending(&key) {
                log::debug!("Deferred edit for {key:?} superseded by a newer one");
            } else if deferrals >= MAX_DEFERRALS {
                log::warn!("Giving up on deferred edit for {key:?} after {deferrals} attempts");
            } else {
                debouncer.schedule_inner(key, value, flush, deferrals + 1);
            }
        }
        outcome
    }
}
