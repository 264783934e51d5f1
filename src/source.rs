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

//! Event source: turns store watch notifications into reconcile requests.
//!
//! The source runs a list-then-watch loop. Every (re)list replaces the
//! object cache and emits a request for every known object, so events lost
//! while the watch was broken are still reconciled eventually. Delivery is
//! at-least-once; handlers must tolerate duplicates.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::ObjectCache;
use crate::config::EventSourceConfig;
use crate::queue::WorkQueue;
use crate::resource::{Object, ObjectKey};
use crate::store::{ObjectStore, StoreError, WatchEvent};

/// Function producing the delay until the next periodic resync.
pub type ResyncPeriodFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Receives object notifications from an [`EventSource`].
pub trait EventHandler<K>: Send + Sync + 'static {
    /// An object appeared.
    fn create(&self, obj: &K);

    /// An object changed. `old` is the previously cached state.
    fn update(&self, old: &K, new: &K);

    /// An object was removed.
    fn delete(&self, obj: &K);

    /// An object was re-emitted by a relist or a periodic resync.
    fn resync(&self, obj: &K) {
        self.create(obj);
    }
}

/// Enqueues the key of every notified object.
#[derive(Debug, Clone)]
pub struct EnqueueRequestForObject {
    queue: WorkQueue<ObjectKey>,
}

impl EnqueueRequestForObject {
    /// Creates a handler feeding `queue`.
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self {
        Self { queue }
    }
}

impl<K: Object> EventHandler<K> for EnqueueRequestForObject {
    fn create(&self, obj: &K) {
        self.queue.add(obj.key());
    }

    fn update(&self, _old: &K, new: &K) {
        self.queue.add(new.key());
    }

    fn delete(&self, obj: &K) {
        self.queue.add(obj.key());
    }
}

/// Filters watch events before they reach the handler.
///
/// Relists and periodic resyncs bypass predicates.
pub trait Predicate<K>: Send + Sync + 'static {
    /// Whether a creation is forwarded.
    fn create(&self, _obj: &K) -> bool {
        true
    }

    /// Whether an update is forwarded.
    fn update(&self, _old: &K, _new: &K) -> bool {
        true
    }

    /// Whether a deletion is forwarded.
    fn delete(&self, _obj: &K) -> bool {
        true
    }
}

/// Drops updates that did not change the spec generation, such as status
/// writes made by the controller itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChangedPredicate;

impl<K: Object> Predicate<K> for GenerationChangedPredicate {
    fn update(&self, old: &K, new: &K) -> bool {
        old.meta().generation != new.meta().generation
    }
}

/// Forwards only events for objects in the given namespaces.
#[derive(Debug, Clone, Default)]
pub struct NamespacePredicate {
    namespaces: HashSet<String>,
}

impl NamespacePredicate {
    /// Creates a predicate accepting `namespaces`.
    pub fn new(namespaces: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    fn accepts(&self, key: &ObjectKey) -> bool {
        self.namespaces.contains(&key.namespace)
    }
}

impl<K: Object> Predicate<K> for NamespacePredicate {
    fn create(&self, obj: &K) -> bool {
        self.accepts(&obj.key())
    }

    fn update(&self, _old: &K, new: &K) -> bool {
        self.accepts(&new.key())
    }

    fn delete(&self, obj: &K) -> bool {
        self.accepts(&obj.key())
    }
}

/// Watches one resource kind and feeds an [`EventHandler`].
pub struct EventSource<K: Object> {
    name: String,
    store: Arc<dyn ObjectStore<K>>,
    cache: ObjectCache<K>,
    namespace: Option<String>,
    predicates: Vec<Arc<dyn Predicate<K>>>,
    resync_period: Option<ResyncPeriodFn>,
    relist_initial_backoff: Duration,
    relist_max_backoff: Duration,
}

impl<K: Object> fmt::Debug for EventSource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("predicates", &self.predicates.len())
            .field("resync", &self.resync_period.is_some())
            .finish()
    }
}

impl<K: Object> EventSource<K> {
    /// Creates a source over `store` that maintains `cache`.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore<K>>,
        cache: ObjectCache<K>,
        config: &EventSourceConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            cache,
            namespace: None,
            predicates: Vec::new(),
            resync_period: None,
            relist_initial_backoff: config.relist_initial_backoff,
            relist_max_backoff: config.relist_max_backoff.max(config.relist_initial_backoff),
        }
    }

    /// Restricts the watch to one namespace.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Adds event predicates. An event is forwarded only if all accept it.
    pub fn with_predicates(mut self, predicates: Vec<Arc<dyn Predicate<K>>>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    /// Enables periodic resyncs of every cached object.
    pub fn with_resync_period(mut self, period: Option<ResyncPeriodFn>) -> Self {
        self.resync_period = period;
        self
    }

    /// Returns the cache maintained by this source.
    pub fn cache(&self) -> &ObjectCache<K> {
        &self.cache
    }

    /// Runs the source in a background task until `cancel` fires.
    pub fn start(self, handler: Arc<dyn EventHandler<K>>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(handler.as_ref(), &cancel).await })
    }

    /// Runs the list-then-watch loop until `cancel` fires.
    pub async fn run(&self, handler: &dyn EventHandler<K>, cancel: &CancellationToken) {
        tracing::info!(source = %self.name, namespace = ?self.namespace, "starting event source");
        let mut backoff = self.relist_initial_backoff;

        loop {
            match self.list_and_watch(handler, cancel, &mut backoff).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(
                        source = %self.name,
                        error = %err,
                        delay_ms = backoff.as_millis() as u64,
                        "watch interrupted, relisting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(self.relist_max_backoff);
                }
            }
        }

        tracing::info!(source = %self.name, "event source stopped");
    }

    /// Performs one list, then consumes the watch until it breaks.
    ///
    /// Returns `Ok` only on cancellation.
    async fn list_and_watch(
        &self,
        handler: &dyn EventHandler<K>,
        cancel: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<(), StoreError> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        // Subscribe before listing so no write lands between the two.
        let namespace = self.namespace.as_deref();
        let mut stream = self.store.watch(namespace).await?;
        let objects = self.store.list(namespace).await?;

        let listed = objects.len();
        for gone in self.cache.replace(objects) {
            handler.delete(gone.as_ref());
        }
        self.resync_all(handler);
        *backoff = self.relist_initial_backoff;
        tracing::debug!(source = %self.name, objects = listed, "cache synced");

        let mut next_resync = self.next_resync();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep_until_opt(next_resync) => {
                    tracing::debug!(source = %self.name, objects = self.cache.len(), "periodic resync");
                    self.resync_all(handler);
                    next_resync = self.next_resync();
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.dispatch(event, handler),
                    Some(Err(err)) => return Err(err),
                    None => return Err(StoreError::WatchExpired),
                },
            }
        }
    }

    fn next_resync(&self) -> Option<Instant> {
        self.resync_period
            .as_ref()
            .map(|period| Instant::now() + period())
    }

    fn resync_all(&self, handler: &dyn EventHandler<K>) {
        for obj in self.cache.list() {
            handler.resync(obj.as_ref());
        }
    }

    fn dispatch(&self, event: WatchEvent<K>, handler: &dyn EventHandler<K>) {
        tracing::trace!(source = %self.name, key = %event.key(), "watch event");
        let previous = self.cache.apply(&event);

        match (&event, previous) {
            (WatchEvent::Added(obj), _) | (WatchEvent::Modified(obj), None) => {
                if self.predicates.iter().all(|p| p.create(obj)) {
                    handler.create(obj);
                }
            }
            (WatchEvent::Modified(new), Some(old)) => {
                if self.predicates.iter().all(|p| p.update(old.as_ref(), new)) {
                    handler.update(old.as_ref(), new);
                }
            }
            (WatchEvent::Deleted(obj), _) => {
                if self.predicates.iter().all(|p| p.delete(obj)) {
                    handler.delete(obj);
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
