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

//! In-memory object store.
//!
//! Behaves like an API server with a status subresource: monotonically
//! increasing resource versions, conditional writes, generation tracking and
//! a broadcast watch. Used by tests and by the demo binary.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{ObjectStore, Result, StoreError, WatchEvent, WatchStream};
use crate::resource::{ObjectKey, Resource, ResourceVersion};

const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Store operations that can be made to fail with [`MemoryStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
    Watch,
}

/// Counters of successful writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
    pub deletes: u64,
}

struct State<S, St> {
    objects: BTreeMap<ObjectKey, Resource<S, St>>,
    last_version: u64,
    events: broadcast::Sender<WatchEvent<Resource<S, St>>>,
    watch_capacity: usize,
    failures: HashMap<Operation, VecDeque<StoreError>>,
    stats: StoreStats,
}

impl<S, St> State<S, St> {
    fn next_version(&mut self) -> ResourceVersion {
        self.last_version += 1;
        ResourceVersion::new(self.last_version.to_string())
    }

    fn take_failure(&mut self, op: Operation) -> Result<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A cloneable handle to a shared in-memory store for `Resource<S, St>`.
pub struct MemoryStore<S, St> {
    state: Arc<Mutex<State<S, St>>>,
}

impl<S, St> Clone for MemoryStore<S, St> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<S, St> fmt::Debug for MemoryStore<S, St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryStore")
            .field("objects", &state.objects.len())
            .field("last_version", &state.last_version)
            .finish()
    }
}

impl<S, St> Default for MemoryStore<S, St>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    St: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, St> MemoryStore<S, St> {
    fn lock(&self) -> MutexGuard<'_, State<S, St>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, St> MemoryStore<S, St>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    St: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Creates an empty store whose watchers may fall at most `capacity`
    /// events behind before their watch expires.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                last_version: 0,
                events,
                watch_capacity: capacity,
                failures: HashMap::new(),
                stats: StoreStats::default(),
            })),
        }
    }

    /// Makes the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: Operation, err: StoreError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Terminates every open watch stream, as an API server restart would.
    pub fn restart(&self) {
        let mut state = self.lock();
        let (events, _) = broadcast::channel(state.watch_capacity);
        state.events = events;
        tracing::debug!("memory store restarted, open watches closed");
    }

    /// Returns counters of successful writes.
    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    fn publish(state: &State<S, St>, event: WatchEvent<Resource<S, St>>) {
        // No subscribers is fine.
        let _ = state.events.send(event);
    }

    fn check_version(key: &ObjectKey, submitted: Option<&ResourceVersion>, stored: &Resource<S, St>) -> Result<()> {
        let (Some(expected), Some(actual)) = (submitted, stored.metadata.resource_version.as_ref()) else {
            return Ok(());
        };
        if expected != actual {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }
}

fn in_namespace(key: &ObjectKey, namespace: Option<&str>) -> bool {
    namespace.map_or(true, |ns| key.namespace == ns)
}

#[async_trait]
impl<S, St> ObjectStore<Resource<S, St>> for MemoryStore<S, St>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    St: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<Resource<S, St>>> {
        let mut state = self.lock();
        state.take_failure(Operation::Get)?;
        Ok(state.objects.get(key).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Resource<S, St>>> {
        let mut state = self.lock();
        state.take_failure(Operation::List)?;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| in_namespace(key, namespace))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, mut obj: Resource<S, St>) -> Result<Resource<S, St>> {
        let mut state = self.lock();
        state.take_failure(Operation::Create)?;

        if obj.metadata.name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".to_string()));
        }
        if obj.metadata.resource_version.is_some() {
            return Err(StoreError::Invalid(
                "resourceVersion must not be set on create".to_string(),
            ));
        }

        let key = obj.metadata.key();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        obj.metadata.resource_version = Some(state.next_version());
        obj.metadata.generation = 1;
        obj.status = None;

        state.objects.insert(key, obj.clone());
        state.stats.creates += 1;
        Self::publish(&state, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, obj: Resource<S, St>) -> Result<Resource<S, St>> {
        let mut state = self.lock();
        state.take_failure(Operation::Update)?;

        let key = obj.metadata.key();
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Self::check_version(&key, obj.metadata.resource_version.as_ref(), stored)?;

        let mut updated = obj;
        updated.status = stored.status.clone();
        updated.metadata.generation = if updated.spec != stored.spec {
            stored.metadata.generation + 1
        } else {
            stored.metadata.generation
        };
        updated.metadata.resource_version = Some(state.next_version());

        state.objects.insert(key, updated.clone());
        state.stats.updates += 1;
        Self::publish(&state, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn update_status(&self, obj: Resource<S, St>) -> Result<Resource<S, St>> {
        let mut state = self.lock();
        state.take_failure(Operation::UpdateStatus)?;

        let key = obj.metadata.key();
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Self::check_version(&key, obj.metadata.resource_version.as_ref(), stored)?;

        let mut updated = stored.clone();
        updated.status = obj.status;
        updated.metadata.resource_version = Some(state.next_version());

        state.objects.insert(key, updated.clone());
        state.stats.status_updates += 1;
        Self::publish(&state, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        state.take_failure(Operation::Delete)?;

        let mut removed = state
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        removed.metadata.resource_version = Some(state.next_version());
        state.stats.deletes += 1;
        Self::publish(&state, WatchEvent::Deleted(removed));
        Ok(())
    }

    async fn watch(&self, namespace: Option<&str>) -> Result<WatchStream<Resource<S, St>>> {
        let receiver = {
            let mut state = self.lock();
            state.take_failure(Operation::Watch)?;
            state.events.subscribe()
        };
        let namespace = namespace.map(str::to_string);

        let stream = futures::stream::unfold(Some(receiver), move |receiver| {
            let namespace = namespace.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if in_namespace(&event.object().metadata.key(), namespace.as_deref()) {
                                return Some((Ok(event), Some(receiver)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!(missed, "watcher fell behind, expiring watch");
                            return Some((Err(StoreError::WatchExpired), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
