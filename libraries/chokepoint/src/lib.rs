//! Per-key mutual exclusion for outbound writes.
//!
//! A [`ChokePoint`] hands out at most one live token per key. Holding a token means
//! "a write for this key is on the wire". Tokens are released explicitly, by dropping
//! the [`Permit`] that owns them, or by a timeout timer so a lost callback can never
//! wedge a key forever. A timed-out key may see one duplicate remote write; it will
//! never see a permanently blocked one.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChokePoint<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    tokens: DashMap<K, Token>,
    timeout: Duration,
    next_generation: AtomicU64,
    timed_out: AtomicU64,
    // woken whenever any token goes away
    released: Notify,
}

struct Token {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Token {
    fn cancel_timer(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

impl<K> Clone for ChokePoint<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for ChokePoint<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl<K> ChokePoint<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tokens: DashMap::new(),
                timeout,
                next_generation: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                released: Notify::new(),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Claim `key`. Returns false (and does nothing) if a token for `key` is already live.
    ///
    /// Every successful `begin` must be paired with exactly one [`ChokePoint::end`]; prefer
    /// [`ChokePoint::acquire`] so that pairing is done by `Drop`.
    pub fn begin(&self, key: K) -> bool {
        self.begin_inner(key).is_some()
    }

    /// Release `key` and cancel its timeout. Returns false if no token was live.
    pub fn end(&self, key: &K) -> bool {
        match self.inner.tokens.remove(key) {
            Some((_, token)) => {
                token.cancel_timer();
                self.inner.released.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Like [`ChokePoint::begin`], but the token is tied to the returned permit.
    pub fn acquire(&self, key: K) -> Option<Permit<K>> {
        let generation = self.begin_inner(key.clone())?;
        Some(Permit {
            chokepoint: self.clone(),
            key,
            generation,
        })
    }

    /// Acquire `key`, waiting up to `max_wait` for a live token to be released.
    pub async fn acquire_waiting(&self, key: K, max_wait: Duration) -> Option<Permit<K>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let mut released = std::pin::pin!(self.inner.released.notified());
            released.as_mut().enable();

            if let Some(permit) = self.acquire(key.clone()) {
                return Some(permit);
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return self.acquire(key);
            }
        }
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.inner.tokens.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tokens.is_empty()
    }

    /// Number of tokens reclaimed by their timer rather than by `end`.
    pub fn timed_out_count(&self) -> u64 {
        self.inner.timed_out.load(Ordering::Relaxed)
    }

    /// Drop every live token and its timer.
    pub fn clear(&self) {
        let keys: Vec<K> = self.inner.tokens.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, token)) = self.inner.tokens.remove(&key) {
                token.cancel_timer();
            }
        }
        self.inner.released.notify_waiters();
    }

    fn begin_inner(&self, key: K) -> Option<u64> {
        match self.inner.tokens.entry(key) {
            Entry::Occupied(entry) => {
                log::debug!("Duplicate operation for {:?} dropped", entry.key());
                None
            }
            Entry::Vacant(entry) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let timer = self.spawn_timeout(entry.key().clone(), generation);
                entry.insert(Token { generation, timer });
                Some(generation)
            }
        }
    }

    fn spawn_timeout(&self, key: K, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime available, token for {key:?} has no timeout");
            return None;
        };
        let inner = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let removed = inner
                .tokens
                .remove_if(&key, |_, token| token.generation == generation);
            if removed.is_some() {
                inner.timed_out.fetch_add(1, Ordering::Relaxed);
                inner.released.notify_waiters();
                log::warn!("Operation for {key:?} timed out after {timeout:?}, key reclaimed");
            }
        }))
    }

    // Only removes the token if it is still the one this permit created.
    fn release(&self, key: &K, generation: u64) -> bool {
        match self
            .inner
            .tokens
            .remove_if(key, |_, token| token.generation == generation)
        {
            Some((_, token)) => {
                token.cancel_timer();
                self.inner.released.notify_waiters();
                true
            }
            None => false,
        }
    }
}

/// A live token. Dropping it ends the token unless the token already timed out.
pub struct Permit<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    chokepoint: ChokePoint<K>,
    key: K,
    generation: u64,
}

impl<K> Permit<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// False once the token has been reclaimed by its timeout.
    pub fn is_live(&self) -> bool {
        self.chokepoint
            .inner
            .tokens
            .get(&self.key)
            .is_some_and(|token| token.generation == self.generation)
    }
}

impl<K> Drop for Permit<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.chokepoint.release(&self.key, self.generation);
    }
}
