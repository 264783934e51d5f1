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

//! Status persistence with optimistic concurrency.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::StatusWriterConfig;
use crate::resource::{HasStatus, Object};
use crate::store::{ObjectStore, StoreError};

/// Outcome of a status write.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate<K> {
    /// The stored status already matched; nothing was written.
    Unchanged,
    /// The status was written. Carries the stored object.
    Written(K),
    /// The object no longer exists.
    Gone,
}

/// Writes controller-computed status back to the store.
///
/// Each write is conditional on the resource version of the object it was
/// computed from, so a write based on a stale read fails with
/// [`StoreError::Conflict`] instead of clobbering a newer spec.
pub struct StatusWriter<K: Object> {
    store: Arc<dyn ObjectStore<K>>,
    retries: u32,
    pause: Duration,
}

impl<K: Object> Clone for StatusWriter<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retries: self.retries,
            pause: self.pause,
        }
    }
}

impl<K: Object> fmt::Debug for StatusWriter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusWriter")
            .field("retries", &self.retries)
            .field("pause", &self.pause)
            .finish()
    }
}

impl<K: HasStatus> StatusWriter<K> {
    /// Creates a writer for `store`.
    pub fn new(store: Arc<dyn ObjectStore<K>>, config: &StatusWriterConfig) -> Self {
        Self {
            store,
            retries: config.conflict_retries.max(1),
            pause: config.conflict_backoff,
        }
    }

    /// Number of read-reconcile-write attempts before a conflict is
    /// surfaced as a transient error.
    pub fn max_attempts(&self) -> u32 {
        self.retries
    }

    /// Pause before the next attempt after a conflict, with up to 10% jitter.
    pub fn conflict_pause(&self) -> Duration {
        if self.pause.is_zero() {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        self.pause.mul_f64(1.0 + jitter)
    }

    /// Writes `status` onto `current`, conditional on `current`'s resource
    /// version. Skips the write if the status is already in place.
    pub async fn update_status(
        &self,
        current: &K,
        status: K::Status,
    ) -> Result<StatusUpdate<K>, StoreError> {
        if current.status() == Some(&status) {
            return Ok(StatusUpdate::Unchanged);
        }

        let mut updated = current.clone();
        updated.set_status(status);

        match self.store.update_status(updated).await {
            Ok(stored) => Ok(StatusUpdate::Written(stored)),
            Err(err) if err.is_not_found() => Ok(StatusUpdate::Gone),
            Err(err) => Err(err),
        }
    }
}
