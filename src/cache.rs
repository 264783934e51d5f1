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

//! Local object cache maintained by the event source.
//!
//! Reconcilers get a read-only view; only watch events and relists mutate it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::resource::{Object, ObjectKey};
use crate::store::WatchEvent;

struct CacheState<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    synced: bool,
}

/// Shared, cloneable cache of the watched objects.
pub struct ObjectCache<K> {
    state: Arc<RwLock<CacheState<K>>>,
}

impl<K> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState {
                objects: HashMap::new(),
                synced: false,
            })),
        }
    }
}

impl<K> fmt::Debug for ObjectCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("ObjectCache")
            .field("objects", &state.objects.len())
            .field("synced", &state.synced)
            .finish()
    }
}

impl<K> ObjectCache<K> {
    fn read(&self) -> RwLockReadGuard<'_, CacheState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Object> ObjectCache<K> {
    /// Creates an empty, unsynced cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached object for `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().objects.get(key).cloned()
    }

    /// Returns every cached object.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().objects.values().cloned().collect()
    }

    /// Returns the keys of every cached object.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().objects.keys().cloned().collect()
    }

    /// Returns the number of cached objects.
    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.read().objects.is_empty()
    }

    /// Returns true once the first full list has been applied.
    pub fn has_synced(&self) -> bool {
        self.read().synced
    }

    /// Applies a watch event and returns the previously cached object.
    pub(crate) fn apply(&self, event: &WatchEvent<K>) -> Option<Arc<K>> {
        let mut state = self.write();
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                state.objects.insert(obj.key(), Arc::new(obj.clone()))
            }
            WatchEvent::Deleted(obj) => state.objects.remove(&obj.key()),
        }
    }

    /// Replaces the whole content with a fresh list and marks the cache
    /// synced. Returns the objects that disappeared.
    pub(crate) fn replace(&self, objects: Vec<K>) -> Vec<Arc<K>> {
        let fresh: HashMap<ObjectKey, Arc<K>> = objects
            .into_iter()
            .map(|obj| (obj.key(), Arc::new(obj)))
            .collect();

        let mut state = self.write();
        let removed = state
            .objects
            .iter()
            .filter(|(key, _)| !fresh.contains_key(key))
            .map(|(_, obj)| obj.clone())
            .collect();
        state.objects = fresh;
        state.synced = true;
        removed
    }
}
