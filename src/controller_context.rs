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

//! Controller context - shared resources for all controllers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::ManagerConfig;
use crate::health::HealthRegistry;
use crate::source::ResyncPeriodFn;

/// Shared context handed to every controller when the manager starts it.
#[derive(Clone)]
pub struct ControllerContext {
    /// Configuration of this manager instance.
    pub config: Arc<ManagerConfig>,

    /// Registry the health probe server reports from. Controllers may
    /// register additional checkers here.
    pub health: HealthRegistry,

    /// Function to generate resync periods.
    ///
    /// Randomized per call so controllers do not resync in lockstep.
    /// `None` when periodic resync is disabled.
    pub resync_period_fn: Option<ResyncPeriodFn>,
}

impl fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerContext")
            .field("config", &self.config)
            .field("resync", &self.resync_period_fn.is_some())
            .finish()
    }
}

impl ControllerContext {
    /// Creates a context. Periodic resync follows `config.generic.resyncPeriod`.
    pub fn new(config: Arc<ManagerConfig>, health: HealthRegistry) -> Self {
        let resync_period_fn = config
            .generic
            .resync_period
            .map(|base| Arc::new(resync_period_fn(base)) as ResyncPeriodFn);

        Self {
            config,
            health,
            resync_period_fn,
        }
    }
}

/// Creates a resync period function with the given base duration.
///
/// The returned function adds up to 100% random jitter.
pub fn resync_period_fn(base: Duration) -> impl Fn() -> Duration + Send + Sync {
    move || {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        base.mul_f64(1.0 + jitter)
    }
}
