//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use controller_runtime_rust::config::ManagerConfig;
use controller_runtime_rust::controller::ControllerError;
use controller_runtime_rust::manager::Manager;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration with short delays so tests converge quickly.
pub fn test_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.generic.shutdown_timeout = Duration::from_secs(5);
    config.rate_limiter.base_delay = Duration::from_millis(10);
    config.rate_limiter.max_delay = Duration::from_millis(500);
    config.status_writer.conflict_backoff = Duration::from_millis(1);
    config.event_source.relist_initial_backoff = Duration::from_millis(10);
    config.event_source.relist_max_backoff = Duration::from_millis(100);
    config
}

/// Polls `check` until it yields a value, panicking after ten seconds.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A manager running in the background.
pub struct Running {
    stop: CancellationToken,
    handle: JoinHandle<Result<(), ControllerError>>,
}

impl Running {
    pub fn start(manager: Manager) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = tokio::spawn(async move { manager.start(token).await });
        Self { stop, handle }
    }

    /// Signals stop and asserts the manager drained cleanly.
    pub async fn stop(self) {
        self.stop.cancel();
        self.handle
            .await
            .expect("manager task panicked")
            .expect("manager returned an error");
    }
}
