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

//! Resource object model.
//!
//! A resource is identified by `(namespace, name)`, carries a store-assigned
//! resource version for optimistic concurrency, a user-owned spec and a
//! controller-owned status. The runtime itself is written against the
//! [`Object`] and [`HasStatus`] capabilities rather than a concrete schema.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of an object, and the payload of a reconcile request.
///
/// Requests carry no object data: workers always re-read the current
/// state from the store before reconciling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace of the object. Empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,

    /// Name of the object, unique within its namespace.
    pub name: String,
}

impl ObjectKey {
    /// Creates a namespaced key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a key for a cluster-scoped object.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }

    /// Returns true if the key has no namespace.
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Opaque token assigned by the store on every write.
///
/// Callers may only compare versions for equality; ordering is a store
/// implementation detail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Wraps a store-issued token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata shared by every resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,

    /// Object namespace, empty when cluster-scoped.
    #[serde(default)]
    pub namespace: String,

    /// Version of the last write. `None` until the object is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<ResourceVersion>,

    /// Spec generation. Starts at 1 and is bumped only when the spec changes.
    #[serde(default)]
    pub generation: u64,

    /// Arbitrary labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Creates metadata for a new, not yet stored object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Returns the identity of the object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// An object with identity and a resource version.
///
/// This is the only capability the queue, cache and event source rely on.
pub trait Object: Clone + fmt::Debug + Send + Sync + 'static {
    /// Returns the object metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Returns the object metadata mutably.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Returns the identity of the object.
    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    /// Returns the resource version of the last observed write.
    fn resource_version(&self) -> Option<&ResourceVersion> {
        self.meta().resource_version.as_ref()
    }
}

/// An object carrying a controller-owned status.
pub trait HasStatus: Object {
    /// The status type. Compared for equality to skip no-op writes.
    type Status: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Returns the current status, if any has been written.
    fn status(&self) -> Option<&Self::Status>;

    /// Replaces the status.
    fn set_status(&mut self, status: Self::Status);
}

/// Generic resource container parameterized by spec and status types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<S, St> {
    /// Identity and versioning.
    pub metadata: ObjectMeta,

    /// Desired state, owned by users.
    pub spec: S,

    /// Observed state, owned by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<St>,
}

impl<S, St> Resource<S, St> {
    /// Creates a resource with no status.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: None,
        }
    }
}

impl<S, St> Object for Resource<S, St>
where
    S: Clone + fmt::Debug + Send + Sync + 'static,
    St: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl<S, St> HasStatus for Resource<S, St>
where
    S: Clone + fmt::Debug + Send + Sync + 'static,
    St: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    type Status = St;

    fn status(&self) -> Option<&St> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: St) {
        self.status = Some(status);
    }
}
