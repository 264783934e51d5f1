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

//! Store client contract.
//!
//! The runtime consumes the persistent object store only through
//! [`ObjectStore`]. Spec and status are written by independent calls, and
//! both are conditional on the resource version carried by the object.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::resource::{Object, ObjectKey, ResourceVersion};

pub use memory::{MemoryStore, Operation, StoreStats};

/// Errors returned by a store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(ObjectKey),

    #[error("object {0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("conflict writing {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("watch expired, a relist is required")]
    WatchExpired,

    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Returns true for a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true for an optimistic-concurrency collision.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A change notification delivered by [`ObjectStore::watch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// The object was created.
    Added(K),
    /// The object was written (spec or status).
    Modified(K),
    /// The object was removed. Carries the last known state.
    Deleted(K),
}

impl<K: Object> WatchEvent<K> {
    /// Returns the object carried by the event.
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// Returns the identity of the object carried by the event.
    pub fn key(&self) -> ObjectKey {
        self.object().key()
    }
}

/// Stream of watch events. An `Err` item or the end of the stream means
/// the watch is broken and the consumer must relist.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Typed access to a persistent object store.
///
/// Implementations assign a new [`ResourceVersion`] on every write. Writes
/// carrying a resource version fail with [`StoreError::Conflict`] when it no
/// longer matches the stored one.
#[async_trait]
pub trait ObjectStore<K: Object>: Send + Sync + 'static {
    /// Reads an object. Returns `Ok(None)` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Lists objects, optionally restricted to a namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    /// Creates an object. The status of the submitted object is ignored.
    async fn create(&self, obj: K) -> Result<K>;

    /// Writes the spec and metadata of an object, leaving its status intact.
    async fn update(&self, obj: K) -> Result<K>;

    /// Writes the status of an object, leaving its spec intact.
    async fn update_status(&self, obj: K) -> Result<K>;

    /// Removes an object.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Subscribes to changes, optionally restricted to a namespace.
    async fn watch(&self, namespace: Option<&str>) -> Result<WatchStream<K>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;

    #[test]
    fn test_error_classification() {
        let key = ObjectKey::new("default", "some");
        assert!(StoreError::NotFound(key.clone()).is_not_found());
        assert!(!StoreError::NotFound(key.clone()).is_conflict());

        let conflict = StoreError::Conflict {
            key,
            expected: ResourceVersion::new("1"),
            actual: ResourceVersion::new("2"),
        };
        assert!(conflict.is_conflict());
        assert!(conflict.to_string().contains("default/some"));
    }

    #[test]
    fn test_watch_event_key() {
        let obj: Resource<String, String> = Resource::new("default", "some", String::new());
        let event = WatchEvent::Deleted(obj);
        assert_eq!(event.key(), ObjectKey::new("default", "some"));
    }
}
