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

//! The reconciler plugin contract.
//!
//! A reconciler maps the current state of one object to its desired status
//! and a scheduling decision. It never writes to the store: the controller
//! persists the returned status and handles conflicts, so policies stay free
//! of optimistic-concurrency concerns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cache::ObjectCache;
use crate::resource::{HasStatus, ObjectKey};

/// Scheduling decision returned by a reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Reconcile again right away.
    pub requeue: bool,

    /// Reconcile again after this delay. Takes precedence over `requeue`.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// The object has converged; wait for the next change.
    pub fn done() -> Self {
        Self::default()
    }

    /// Reconcile again immediately.
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Reconcile again after `delay`.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    /// Returns true if no further reconcile was requested.
    pub fn is_done(&self) -> bool {
        !self.requeue && self.requeue_after.map_or(true, |d| d.is_zero())
    }
}

/// Outcome of a reconcile: the desired status and what to do next.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation<St> {
    /// Desired status. `None` leaves the stored status untouched.
    pub status: Option<St>,

    /// Scheduling decision.
    pub result: ReconcileResult,
}

impl<St> Reconciliation<St> {
    /// Sets `status` and reports convergence.
    pub fn status(status: St) -> Self {
        Self {
            status: Some(status),
            result: ReconcileResult::done(),
        }
    }

    /// Leaves the status untouched and reports convergence.
    pub fn unchanged() -> Self {
        Self {
            status: None,
            result: ReconcileResult::done(),
        }
    }

    /// Replaces the scheduling decision.
    pub fn with_result(mut self, result: ReconcileResult) -> Self {
        self.result = result;
        self
    }
}

/// Per-request context handed to a reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileContext<K> {
    /// The object being reconciled.
    pub request: ObjectKey,

    /// Number of backoff retries this request has had so far.
    pub attempt: u32,

    /// Cancelled when the manager is stopping. Long reconciles should
    /// check it and return early.
    pub cancel: CancellationToken,

    /// Read-only view of every watched object.
    pub cache: ObjectCache<K>,
}

/// Business logic of a controller.
///
/// Implementations must be idempotent: reconciling an unchanged object
/// twice yields the same status and no side effects the second time.
/// Returning an error schedules a backoff retry; a terminal business
/// failure is expressed as a status instead.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The reconciled resource kind.
    type Object: HasStatus;

    /// Transient failure of the policy.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Computes the desired status of `obj`.
    async fn reconcile(
        &self,
        ctx: &ReconcileContext<Self::Object>,
        obj: Arc<Self::Object>,
    ) -> Result<Reconciliation<<Self::Object as HasStatus>::Status>, Self::Error>;
}
