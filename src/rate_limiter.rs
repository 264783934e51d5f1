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

//! Per-item retry rate limiting for the work queue.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::config::RateLimiterConfig;

/// Decides how long an item waits before it is retried.
pub trait RateLimiter<T>: Send + Sync + 'static {
    /// Records a failure of `item` and returns the delay before its retry.
    fn when(&self, item: &T) -> Duration;

    /// Clears the failure history of `item`.
    fn forget(&self, item: &T);

    /// Returns how many times `item` has been retried since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

impl<T: 'static> RateLimiter<T> for Box<dyn RateLimiter<T>> {
    fn when(&self, item: &T) -> Duration {
        (**self).when(item)
    }

    fn forget(&self, item: &T) {
        (**self).forget(item)
    }

    fn num_requeues(&self, item: &T) -> u32 {
        (**self).num_requeues(item)
    }
}

/// Exponential per-item backoff: `base * 2^failures`, capped at `max`.
///
/// The retry count itself is unbounded; only the delay saturates.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<T> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    /// Creates a limiter with the given base and maximum delay.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a limiter from configuration.
    pub fn from_config(config: &RateLimiterConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }

    fn backoff(&self, exponent: u32) -> Duration {
        // 2^31 * base overflows any sane max, so stop doubling early.
        if exponent >= 31 {
            return self.max_delay;
        }
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl<T> Default for ItemExponentialFailureRateLimiter<T> {
    fn default() -> Self {
        Self::from_config(&RateLimiterConfig::default())
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);
        self.backoff(exponent)
    }

    fn forget(&self, item: &T) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_until_cap() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_millis(30),
        );

        let delays: Vec<_> = (0..5).map(|_| limiter.when(&"a")).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
                Duration::from_millis(30),
            ]
        );
        assert_eq!(limiter.num_requeues(&"a"), 5);
    }

    #[test]
    fn test_items_are_tracked_independently() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_secs(1),
        );
        limiter.when(&"a");
        limiter.when(&"a");

        assert_eq!(limiter.when(&"b"), Duration::from_millis(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_secs(1),
        );
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");

        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
    }

    #[test]
    fn test_many_failures_do_not_overflow() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_secs(1),
            Duration::from_secs(1000),
        );
        for _ in 0..100 {
            assert!(limiter.when(&"a") <= Duration::from_secs(1000));
        }
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1000));
    }
}
