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

//! Configuration structures for the manager and its controllers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for a [`Manager`](crate::manager::Manager).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Settings shared by every controller.
    #[serde(default)]
    pub generic: GenericManagerConfig,

    /// Retry backoff of failed reconciles.
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// Conflict handling of status writes.
    #[serde(default)]
    pub status_writer: StatusWriterConfig,

    /// Watch and relist behavior.
    #[serde(default)]
    pub event_source: EventSourceConfig,
}

impl ManagerConfig {
    /// Checks the configuration for values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.generic.concurrent_reconciles == 0 {
            return Err("generic.concurrentReconciles must be at least 1".to_string());
        }
        if self.rate_limiter.base_delay.is_zero() {
            return Err("rateLimiter.baseDelay must be greater than zero".to_string());
        }
        if self.rate_limiter.max_delay < self.rate_limiter.base_delay {
            return Err("rateLimiter.maxDelay must not be lower than baseDelay".to_string());
        }
        if self.status_writer.conflict_retries == 0 {
            return Err("statusWriter.conflictRetries must be at least 1".to_string());
        }
        if self.event_source.relist_max_backoff < self.event_source.relist_initial_backoff {
            return Err(
                "eventSource.relistMaxBackoff must not be lower than relistInitialBackoff"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Settings applicable to all controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericManagerConfig {
    /// Restrict every controller to this namespace. All namespaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Number of concurrent reconcile workers per controller.
    #[serde(default = "default_concurrent_reconciles")]
    pub concurrent_reconciles: usize,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Period of full resyncs of every cached object. Disabled when unset.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub resync_period: Option<Duration>,

    /// Address of the health probe server, e.g. `0.0.0.0:8081`. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_probe_bind_address: Option<String>,
}

impl Default for GenericManagerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrent_reconciles: default_concurrent_reconciles(),
            shutdown_timeout: default_shutdown_timeout(),
            resync_period: None,
            health_probe_bind_address: None,
        }
    }
}

fn default_concurrent_reconciles() -> usize {
    1
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Exponential backoff applied to failed reconciles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Delay before the first retry.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound of the retry delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1000)
}

/// Conflict handling of status writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusWriterConfig {
    /// Attempts (read, reconcile, write) before a conflict becomes a
    /// transient error.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Pause between attempts. Jittered by up to 10%.
    #[serde(default = "default_conflict_backoff", with = "humantime_serde")]
    pub conflict_backoff: Duration,
}

impl Default for StatusWriterConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            conflict_backoff: default_conflict_backoff(),
        }
    }
}

fn default_conflict_retries() -> u32 {
    5
}

fn default_conflict_backoff() -> Duration {
    Duration::from_millis(10)
}

/// Watch and relist behavior of event sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSourceConfig {
    /// Delay before the first relist after a broken watch.
    #[serde(default = "default_relist_initial_backoff", with = "humantime_serde")]
    pub relist_initial_backoff: Duration,

    /// Upper bound of the relist delay while the store stays unavailable.
    #[serde(default = "default_relist_max_backoff", with = "humantime_serde")]
    pub relist_max_backoff: Duration,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            relist_initial_backoff: default_relist_initial_backoff(),
            relist_max_backoff: default_relist_max_backoff(),
        }
    }
}

fn default_relist_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_relist_max_backoff() -> Duration {
    Duration::from_secs(30)
}
