//! Instant checkbox toggles with one serialized write queue per key.
//!
//! A toggle is applied to the key's pending snapshot (not to the committed value), so
//! rapid taps compose. Readers prefer the pending snapshot until a write carrying it
//! succeeds. Each key has at most one worker: a toggle that arrives while the worker is
//! waiting simply changes what it will send, and a toggle that arrives mid-write makes the
//! worker go around once more after the write finishes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Result of handing a snapshot to the writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Saved remotely and committed locally.
    Written,
    /// Another write for the record is outbound, or it has no remote identifier yet.
    Busy,
    /// The record is gone remotely; nothing will be sent.
    Abandoned,
    Failed,
}

pub type CompletionWriteFn<K> =
    Arc<dyn Fn(K, Vec<bool>) -> BoxFuture<'static, WriteOutcome> + Send + Sync>;

const BUSY_BACKOFF_FLOOR: Duration = Duration::from_millis(50);

pub struct CompletionMerger<K> {
    inner: Arc<MergerInner<K>>,
}

struct MergerInner<K> {
    coalesce: Duration,
    max_busy_retries: u32,
    state: Mutex<MergerState<K>>,
}

struct MergerState<K> {
    pending: HashMap<K, Vec<bool>>,
    queues: HashMap<K, Queue>,
}

struct Queue {
    dirty: bool,
    wake: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

impl<K> Clone for CompletionMerger<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> CompletionMerger<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(coalesce: Duration, max_busy_retries: u32) -> Self {
        Self {
            inner: Arc::new(MergerInner {
                coalesce,
                max_busy_retries,
                state: Mutex::new(MergerState {
                    pending: HashMap::new(),
                    queues: HashMap::new(),
                }),
            }),
        }
    }

    /// Flip `index` on top of the latest pending snapshot and queue a write.
    /// Returns the snapshot readers should now display.
    pub fn toggle(
        &self,
        key: K,
        index: usize,
        committed: &[bool],
        writer: CompletionWriteFn<K>,
    ) -> Vec<bool> {
        self.merge(key, committed, writer, |snapshot| {
            if let Some(done) = snapshot.get_mut(index) {
                *done = !*done;
            }
        })
    }

    /// Replace the pending snapshot wholesale and queue a write.
    pub fn replace(&self, key: K, snapshot: Vec<bool>, writer: CompletionWriteFn<K>) -> Vec<bool> {
        self.merge(key, &[], writer, move |pending| *pending = snapshot)
    }

    pub fn merge(
        &self,
        key: K,
        committed: &[bool],
        writer: CompletionWriteFn<K>,
        edit: impl FnOnce(&mut Vec<bool>),
    ) -> Vec<bool> {
        let mut state = self.inner.lock();
        let snapshot = {
            let snapshot = state
                .pending
                .entry(key.clone())
                .or_insert_with(|| committed.to_vec());
            edit(snapshot);
            snapshot.clone()
        };

        match state.queues.get_mut(&key) {
            Some(queue) => queue.dirty = true,
            None => {
                let wake = Arc::new(Notify::new());
                let worker = self.spawn_worker(key.clone(), writer, Arc::clone(&wake));
                state.queues.insert(
                    key,
                    Queue {
                        dirty: true,
                        wake,
                        worker,
                    },
                );
            }
        }
        snapshot
    }

    pub fn pending(&self, key: &K) -> Option<Vec<bool>> {
        self.inner.lock().pending.get(key).cloned()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    /// What readers should show: the pending snapshot if there is one, else `committed`.
    pub fn display(&self, key: &K, committed: &[bool]) -> Vec<bool> {
        self.pending(key).unwrap_or_else(|| committed.to_vec())
    }

    /// Keep a pending snapshot the same length as the exercise's set count.
    pub fn resize(&self, key: &K, len: usize) {
        if let Some(snapshot) = self.inner.lock().pending.get_mut(key) {
            snapshot.resize(len, false);
        }
    }

    /// Forget `key`. A write already on the wire finishes; nothing further is sent.
    pub fn clear(&self, key: &K) {
        let mut state = self.inner.lock();
        state.pending.remove(key);
        if let Some(queue) = state.queues.get_mut(key) {
            queue.dirty = false;
            queue.wake.notify_one();
        }
    }

    /// Skip the coalesce window for every queued write and wait for the queues to drain.
    pub async fn flush_all(&self) {
        let workers: Vec<JoinHandle<()>> = {
            let mut state = self.inner.lock();
            state
                .queues
                .values_mut()
                .filter_map(|queue| {
                    queue.wake.notify_one();
                    queue.worker.take()
                })
                .collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    log::error!("Completion worker panicked: {e}");
                }
            }
        }
    }

    /// Abort every worker and drop every pending snapshot.
    pub fn cancel_all(&self) {
        let mut state = self.inner.lock();
        state.pending.clear();
        for (_, queue) in state.queues.drain() {
            if let Some(worker) = queue.worker {
                worker.abort();
            }
        }
    }

    fn spawn_worker(
        &self,
        key: K,
        writer: CompletionWriteFn<K>,
        wake: Arc<Notify>,
    ) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime available, completion write for {key:?} not queued");
            return None;
        };
        let inner = Arc::clone(&self.inner);
        Some(handle.spawn(async move { inner.work(key, writer, wake).await }))
    }
}

impl<K> MergerInner<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, MergerState<K>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn work(&self, key: K, writer: CompletionWriteFn<K>, wake: Arc<Notify>) {
        let mut busy_retries = 0;
        let mut wait = self.coalesce;
        loop {
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = wake.notified() => {}
                }
            }

            let Some(snapshot) = self.take_snapshot(&key) else {
                return;
            };

            let outcome = writer(key.clone(), snapshot.clone()).await;
            wait = self.coalesce;
            match outcome {
                WriteOutcome::Written => {
                    busy_retries = 0;
                    let mut state = self.lock();
                    if state.pending.get(&key) == Some(&snapshot) {
                        state.pending.remove(&key);
                    }
                }
                WriteOutcome::Busy => {
                    busy_retries += 1;
                    let mut state = self.lock();
                    let has_pending = state.pending.contains_key(&key);
                    if busy_retries > self.max_busy_retries {
                        log::warn!(
                            "Completion write for {key:?} still blocked after {busy_retries} tries, keeping it pending"
                        );
                    } else if let Some(queue) = state.queues.get_mut(&key) {
                        queue.dirty = has_pending;
                        wait = self.coalesce.max(BUSY_BACKOFF_FLOOR);
                    }
                }
                WriteOutcome::Abandoned | WriteOutcome::Failed => {
                    log::warn!("Completion write for {key:?} {outcome:?}, keeping pending snapshot");
                }
            }

            if self.finish_if_idle(&key) {
                return;
            }
        }
    }

    fn take_snapshot(&self, key: &K) -> Option<Vec<bool>> {
        let mut state = self.lock();
        let dirty = state.queues.get(key).is_some_and(|queue| queue.dirty);
        let snapshot = if dirty {
            state.pending.get(key).cloned()
        } else {
            None
        };
        match snapshot {
            Some(snapshot) => {
                if let Some(queue) = state.queues.get_mut(key) {
                    queue.dirty = false;
                }
                Some(snapshot)
            }
            None => {
                state.queues.remove(key);
                None
            }
        }
    }

    // Exit and enqueue both hold the lock, so a toggle can't slip between them.
    fn finish_if_idle(&self, key: &K) -> bool {
        let mut state = self.lock();
        let dirty = state.queues.get(key).is_some_and(|queue| queue.dirty);
        if !dirty {
            state.queues.remove(key);
        }
        !dirty
    }
}
