// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rate-limited, deduplicating work queue.
//!
//! The queue guarantees that:
//! - an item is queued at most once, however often it is added (dedup);
//! - an item is never handed to two workers at the same time (single-flight);
//! - an item added while it is being processed is handed out again once the
//!   worker calls [`WorkQueue::done`] (coalescing).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::rate_limiter::{ItemExponentialFailureRateLimiter, RateLimiter};

struct State<T> {
    /// Items ready to be handed out, in FIFO order.
    queue: VecDeque<T>,
    /// Items that need processing. Superset of `queue`.
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    /// Pending delayed adds, one timer per item.
    waiting: HashMap<T, Delayed>,
    shutting_down: bool,
}

struct Delayed {
    deadline: Instant,
    timer: AbortHandle,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    ready: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

/// A cloneable handle to a shared work queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("waiting", &state.waiting.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the queue name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<T> WorkQueue<T>
where
    T: Hash + Eq + Clone + fmt::Display + Send + Sync + 'static,
{
    /// Creates a queue with the default exponential rate limiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, ItemExponentialFailureRateLimiter::default())
    }

    /// Creates a queue with the given rate limiter.
    pub fn with_rate_limiter(name: impl Into<String>, rate_limiter: impl RateLimiter<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Marks `item` as needing processing.
    ///
    /// No-op if the item is already queued. If a worker currently holds the
    /// item, it is queued again when that worker calls [`done`](Self::done).
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down {
            tracing::trace!(queue = %self.inner.name, item = %item, "dropping add after shutdown");
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Waits for the next item and marks it as processing.
    ///
    /// Returns `None` once the queue is shut down and every queued item has
    /// been handed out.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks processing of `item` as finished.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.ready.notify_one();
        }
    }

    /// Adds `item` once `delay` has elapsed.
    ///
    /// When several delayed adds of the same item are pending, the earliest
    /// deadline wins and the later timer is aborted. Must be called from
    /// within a Tokio runtime.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let deadline = Instant::now() + delay;
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if let Some(existing) = state.waiting.get(&item) {
            if existing.deadline <= deadline {
                return;
            }
        }

        // Spawned under the lock so the timer cannot observe the map before
        // its own entry is in place.
        let queue = self.clone();
        let key = item.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.lock();
                match state.waiting.get(&key) {
                    Some(pending) if pending.deadline == deadline => {
                        state.waiting.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if due {
                queue.add(key);
            }
        })
        .abort_handle();

        if let Some(replaced) = state.waiting.insert(item, Delayed { deadline, timer }) {
            replaced.timer.abort();
        }
    }

    /// Adds `item` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item);
        tracing::debug!(
            queue = %self.inner.name,
            item = %item,
            delay_ms = delay.as_millis() as u64,
            "requeueing with backoff"
        );
        self.add_after(item, delay);
    }

    /// Resets the rate limiter history of `item`.
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    /// Returns how many rate-limited requeues `item` has had.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Returns the number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no item is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Returns the number of pending delayed adds.
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Returns true if a worker currently holds `item`.
    pub fn is_processing(&self, item: &T) -> bool {
        self.lock().processing.contains(item)
    }

    /// Stops accepting new items and discards pending delayed adds.
    ///
    /// Items already queued are still handed out; [`get`](Self::get)
    /// returns `None` once they are drained.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            for (_, pending) in state.waiting.drain() {
                pending.timer.abort();
            }
        }
        self.inner.ready.notify_waiters();
        tracing::debug!(queue = %self.inner.name, "work queue shut down");
    }

    /// Returns true once [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
