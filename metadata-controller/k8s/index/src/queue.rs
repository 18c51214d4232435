//! A deduplicating work queue.
//!
//! Keys, not events, are queued: enqueuing a key that is already pending is a no-op, so a burst of
//! notifications for one object collapses into a single reconciliation. A key is never handed to
//! two workers at once. If it is enqueued while in flight, it is marked dirty and queued again
//! once the in-flight item is marked done.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, hash::Hash, sync::Arc};
use tokio::{
    sync::Notify,
    time::{self, Duration},
};

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

/// Controls how failed keys are requeued.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// The delay before the first retry. Doubles with each consecutive failure.
    pub base: Duration,
    pub max: Duration,
    /// The number of consecutive failures after which a key is dropped.
    pub max_retries: u32,
}

/// A dequeued key. Must be handed back with [`WorkQueue::done`] or [`WorkQueue::retry`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Item<K> {
    key: K,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

struct State<K> {
    pending: VecDeque<K>,
    /// Keys that are pending or were enqueued while in flight.
    dirty: HashSet<K>,
    in_flight: HashSet<K>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

// === impl WorkQueue ===

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    dirty: HashSet::new(),
                    in_flight: HashSet::new(),
                    failures: HashMap::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Adds a key to the queue.
    ///
    /// Returns true if the key became pending. Keys already pending, keys in flight (which are
    /// requeued when done), and keys added after shutdown are not queued again.
    pub fn enqueue(&self, key: K) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutdown || !state.dirty.insert(key.clone()) {
            return false;
        }
        if state.in_flight.contains(&key) {
            tracing::trace!(?key, "Deferring in-flight key");
            return false;
        }
        state.pending.push_back(key);
        drop(state);

        self.inner.notify.notify_one();
        true
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once the queue has been shut down and all pending keys were handed out.
    pub async fn dequeue(&self) -> Option<Item<K>> {
        loop {
            // Register interest before inspecting the state so that a notification sent between
            // the check and the await is not lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.inner.state.lock();
                match state.pending.pop_front() {
                    Some(key) => {
                        state.dirty.remove(&key);
                        state.in_flight.insert(key.clone());
                        Some((key, !state.pending.is_empty()))
                    }
                    None if state.shutdown => return None,
                    None => None,
                }
            };

            match next {
                Some((key, more)) => {
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(Item { key });
                }
                None => notified.await,
            }
        }
    }

    /// Marks a key as successfully processed, forgetting its failures.
    pub fn done(&self, item: Item<K>) {
        self.inner.state.lock().failures.remove(&item.key);
        self.finish(item.key);
    }

    /// Marks a key as failed and schedules it to be requeued after a backoff.
    ///
    /// Returns false if the key exceeded its retry budget and was dropped.
    pub fn retry(&self, item: Item<K>) -> bool {
        let Item { key } = item;
        let backoff = self.inner.backoff;

        let attempts = {
            let mut state = self.inner.state.lock();
            let attempts = state.failures.entry(key.clone()).or_default();
            *attempts += 1;
            let n = *attempts;
            if n > backoff.max_retries {
                state.failures.remove(&key);
            }
            n
        };
        self.finish(key.clone());

        if attempts > backoff.max_retries {
            tracing::warn!(?key, attempts, "Dropping key after repeated failures");
            return false;
        }

        let delay = backoff.delay(attempts);
        tracing::debug!(?key, attempts, ?delay, "Requeueing");
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.enqueue(key);
        });
        true
    }

    /// Stops accepting keys. Pending keys are still handed out, after which all waiting and future
    /// calls to [`WorkQueue::dequeue`] return `None`.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// The number of pending keys, excluding keys in flight.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(&self, key: K) {
        let mut state = self.inner.state.lock();
        state.in_flight.remove(&key);
        if state.dirty.contains(&key) {
            state.pending.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("backoff", &self.inner.backoff)
            .finish_non_exhaustive()
    }
}

// === impl Item ===

impl<K> Item<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

// === impl Backoff ===

impl Backoff {
    /// The delay before the given retry attempt (starting at 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}
