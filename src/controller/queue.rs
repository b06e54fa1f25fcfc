//! # Work Queue
//!
//! Deduplicating, retry-aware queue of object keys awaiting reconciliation.
//!
//! Three sets drive it:
//! - `dirty`: keys that need a reconcile (queued or waiting for an in-flight run to finish)
//! - `processing`: keys handed to a worker and not yet `done`
//! - `queue`: FIFO of dirty keys that are not processing
//!
//! Adding a key that is already dirty is a no-op. Adding a key that is being
//! processed only marks it dirty, and `done` puts it back on the queue. So at
//! most one worker holds a given key at any time, and a change that lands
//! mid-reconcile always gets one more run afterwards.

use crate::controller::backoff::ExponentialBackoff;
use crate::crd::ObjectKey;
use crate::observability::metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    /// Consecutive failures per key, reset by `forget`
    failures: HashMap<ObjectKey, u32>,
    /// Earliest pending delayed add per key
    waiting: HashMap<ObjectKey, Instant>,
    shutting_down: bool,
}

#[derive(Debug)]
pub struct WorkQueue {
    kind: String,
    state: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
    backoff: ExponentialBackoff,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(kind: impl Into<String>, backoff: ExponentialBackoff) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            idle: Notify::new(),
            backoff,
            shutdown: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_depth(&self, state: &QueueState) {
        metrics::set_queue_depth(&self.kind, state.queue.len());
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Mark `key` as needing a reconcile
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // Re-queued by `done`
            return;
        }
        state.queue.push_back(key);
        self.publish_depth(&state);
        drop(state);
        self.available.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key is exclusively held by the caller until `done` is called.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    self.publish_depth(&state);
                    drop(state);
                    if more {
                        self.available.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing. If it was re-added meanwhile it is queued again.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        let requeue = !state.shutting_down && state.dirty.contains(key);
        if requeue {
            state.queue.push_back(key.clone());
            self.publish_depth(&state);
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.available.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Add `key` once `delay` has elapsed. Of several pending delayed adds for
    /// the same key only the earliest is kept.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&key).is_some_and(|at| *at <= ready_at) {
                return;
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = queue.shutdown.cancelled() => {}
                () = tokio::time::sleep_until(ready_at) => {
                    let due = {
                        let mut state = queue.lock();
                        if state.waiting.get(&key) == Some(&ready_at) {
                            state.waiting.remove(&key);
                            true
                        } else {
                            false
                        }
                    };
                    if due {
                        queue.add(key);
                    }
                }
            }
        });
    }

    /// Record a failure for `key` and schedule a retry after the backoff for
    /// its attempt count. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let attempts = {
            let mut state = self.lock();
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            *attempts = attempts.saturating_add(1);
            *attempts
        };
        let delay = self.backoff.delay_for(attempts);
        self.add_after(key, delay);
        delay
    }

    /// Clear the failure history of `key` (after a success or a terminal outcome)
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Failures recorded for `key` since the last `forget`
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &ObjectKey) -> bool {
        self.lock().processing.contains(key)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop handing out keys. Waiting `get` calls return `None`, pending delayed
    /// adds are dropped, and in-flight keys may still call `done`.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.shutdown.cancel();
        self.available.notify_waiters();
    }

    /// Resolve once no key is being processed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
