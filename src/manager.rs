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

//! Manager - the process-wide composition root.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::health::{BoxFuture, HealthChecker, HealthRegistry, HealthServer};

/// Owns the registered controllers and their start/stop lifecycle.
///
/// ```rust,no_run
/// use controller_runtime_rust::config::ManagerConfig;
/// use controller_runtime_rust::manager::Manager;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut manager = Manager::new(ManagerConfig::default());
/// // ControllerBuilder::new(..).setup_with_manager(&mut manager)?;
/// manager.start(CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Manager {
    /// Configuration for this instance.
    config: Arc<ManagerConfig>,

    /// Registry served by the health probe server.
    health: HealthRegistry,

    /// Registered controllers, in registration order.
    controllers: Vec<Arc<dyn Controller>>,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("controllers", &self.controller_names())
            .finish()
    }
}

impl Manager {
    /// Creates a manager with no controllers.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config: Arc::new(config),
            health: HealthRegistry::new(),
            controllers: Vec::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Returns the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns the health registry served on the probe address.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Returns the names of the registered controllers.
    pub fn controller_names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// Registers a controller. Names must be unique.
    pub fn add(&mut self, controller: Arc<dyn Controller>) -> Result<()> {
        let name = controller.name();
        if self.controllers.iter().any(|c| c.name() == name) {
            return Err(ControllerError::AlreadyRegistered(name.to_string()));
        }
        tracing::debug!(controller = %name, "registered controller");
        self.controllers.push(controller);
        Ok(())
    }

    /// Runs every registered controller until `stop` fires or one of them
    /// fails, then waits up to `shutdownTimeout` for all of them to drain.
    pub async fn start(&self, stop: CancellationToken) -> Result<()> {
        tracing::info!(controllers = self.controllers.len(), "starting manager");

        if self.controllers.is_empty() {
            tracing::warn!("no controllers registered, exiting");
            return Ok(());
        }

        let ctx = ControllerContext::new(self.config.clone(), self.health.clone());
        for controller in &self.controllers {
            ctx.health
                .register(Arc::new(ControllerReadiness(controller.clone())))
                .await;
        }

        // Cancelled on stop, and on the first controller failure.
        let cancel = stop.child_token();

        if let Some(address) = &self.config.generic.health_probe_bind_address {
            let server = HealthServer::bind(address, ctx.health.clone())
                .await
                .map_err(|e| ControllerError::StartFailed {
                    name: "health-probe".to_string(),
                    source: e.into(),
                })?;
            tracing::info!(address = %address, "health probe server listening");
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(cancel).await {
                    tracing::error!(error = %e, "health probe server failed");
                }
            });
        }

        self.run_controllers(ctx, cancel).await
    }

    /// Runs all controllers concurrently.
    async fn run_controllers(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let mut join_set = JoinSet::new();

        for controller in &self.controllers {
            let controller = controller.clone();
            let name = controller.name().to_string();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let running = self.running_controllers.clone();

            join_set.spawn(async move {
                tracing::info!(
                    controller = %name,
                    workers = controller.worker_count(),
                    "starting controller"
                );
                running.write().await.insert(name.clone());

                let result = controller.run(ctx, cancel).await;

                running.write().await.remove(&name);

                if let Err(e) = controller.shutdown().await {
                    tracing::warn!(controller = %name, error = %e, "controller shutdown hook failed");
                }

                match result {
                    Ok(()) => {
                        tracing::info!(controller = %name, "controller terminated successfully");
                    }
                    Err(ref e) => {
                        tracing::error!(controller = %name, error = %e, "controller terminated with error");
                    }
                }

                (name, result)
            });
        }

        let mut failure = None;

        tokio::select! {
            result = async {
                while let Some(result) = join_set.join_next().await {
                    match result {
                        Ok((name, Ok(()))) => {
                            tracing::debug!(controller = %name, "controller finished");
                        }
                        Ok((_, Err(e))) => return Err(e),
                        Err(e) => {
                            if e.is_panic() {
                                tracing::error!("controller task panicked");
                            }
                            return Err(ControllerError::Runtime {
                                name: "unknown".to_string(),
                                source: e.into(),
                            });
                        }
                    }
                }
                Ok(())
            } => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "controller failed, stopping manager");
                    failure = Some(e);
                    cancel.cancel();
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        let drain_failure = self.drain(&mut join_set).await;

        match failure.or(drain_failure) {
            Some(e) => Err(e),
            None => {
                tracing::info!("manager stopped");
                Ok(())
            }
        }
    }

    /// Waits for remaining controllers, at most `shutdownTimeout`.
    ///
    /// Returns the first error a controller reported while stopping.
    async fn drain(&self, join_set: &mut JoinSet<(String, Result<()>)>) -> Option<ControllerError> {
        let mut first_error = None;
        let shutdown_timeout = self.config.generic.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                if !running.is_empty() {
                    tracing::warn!(
                        timeout = %humantime::format_duration(shutdown_timeout),
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "shutdown timeout reached, controllers still running"
                    );
                }
                join_set.abort_all();
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(Ok((name, Ok(())))) => {
                            tracing::debug!(controller = %name, "controller stopped");
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                            first_error.get_or_insert(e);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "controller task failed");
                            first_error.get_or_insert(ControllerError::Runtime {
                                name: "unknown".to_string(),
                                source: e.into(),
                            });
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }

        first_error
    }
}

/// Readiness of one controller, as reported by [`Controller::health_check`].
struct ControllerReadiness(Arc<dyn Controller>);

impl HealthChecker for ControllerReadiness {
    fn check(&self) -> BoxFuture<'_, bool> {
        self.0.health_check()
    }

    fn name(&self) -> &str {
        self.0.name()
    }
}
