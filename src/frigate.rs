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

//! The Frigate resource and its reconciler.
//!
//! A Frigate is complete when `spec.foo` is set and failed otherwise. The
//! failure is a business outcome recorded in the status, not a reconcile
//! error, so it is never retried.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::controller::{ControllerBuilder, ReconcileController, Result};
use crate::manager::Manager;
use crate::reconciler::{ReconcileContext, Reconciler, Reconciliation};
use crate::resource::{Object, Resource};
use crate::source::GenerationChangedPredicate;
use crate::store::ObjectStore;

/// Desired state of a Frigate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrigateSpec {
    /// Must be non-empty for the Frigate to complete.
    #[serde(default)]
    pub foo: String,
}

/// Lifecycle phase of a Frigate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Not reconciled yet.
    #[default]
    Pending,
    /// Reconciled successfully.
    Completed,
    /// The spec cannot be satisfied.
    Failure,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Completed => "Completed",
            Phase::Failure => "Failure",
        };
        f.write_str(s)
    }
}

/// Observed state of a Frigate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrigateStatus {
    /// Current phase.
    pub phase: Phase,

    /// Why the Frigate failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec this status was computed from.
    #[serde(default)]
    pub observed_generation: u64,
}

/// A Frigate resource.
pub type Frigate = Resource<FrigateSpec, FrigateStatus>;

/// Returns the phase of `frigate`, `Pending` until a status is written.
pub fn phase(frigate: &Frigate) -> Phase {
    frigate.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

/// Reconciles Frigates.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrigateReconciler;

impl FrigateReconciler {
    /// Controller name used in logs and probes.
    pub const NAME: &'static str = "frigate";

    /// Computes the status `frigate` should have.
    pub fn desired_status(frigate: &Frigate) -> FrigateStatus {
        let observed_generation = frigate.meta().generation;
        if frigate.spec.foo.is_empty() {
            FrigateStatus {
                phase: Phase::Failure,
                message: Some("spec.foo must not be empty".to_string()),
                observed_generation,
            }
        } else {
            FrigateStatus {
                phase: Phase::Completed,
                message: None,
                observed_generation,
            }
        }
    }

    /// Registers a Frigate controller over `store` with `manager`.
    pub fn setup_with_manager(
        store: Arc<dyn ObjectStore<Frigate>>,
        manager: &mut Manager,
    ) -> Result<Arc<ReconcileController<Self>>> {
        ControllerBuilder::new(Self::NAME, store, FrigateReconciler)
            .with_predicate(GenerationChangedPredicate)
            .setup_with_manager(manager)
    }
}

#[async_trait]
impl Reconciler for FrigateReconciler {
    type Object = Frigate;
    type Error = Infallible;

    async fn reconcile(
        &self,
        _ctx: &ReconcileContext<Frigate>,
        frigate: Arc<Frigate>,
    ) -> std::result::Result<Reconciliation<FrigateStatus>, Infallible> {
        let status = Self::desired_status(&frigate);
        if status.phase == Phase::Failure {
            tracing::info!(key = %frigate.key(), "frigate has no foo, marking as failed");
        }
        Ok(Reconciliation::status(status))
    }
}
