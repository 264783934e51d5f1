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

//! Core controller traits and the reconcile loop.
//!
//! [`Controller`] is the lifecycle interface the [`Manager`] drives.
//! [`ReconcileController`] implements it for any [`Reconciler`]: an event
//! source feeds a work queue, and a pool of workers drains the queue,
//! invoking the reconciler and persisting the status it returns.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::Instrument;

pub use tokio_util::sync::CancellationToken;

use crate::cache::ObjectCache;
use crate::config::ManagerConfig;
use crate::controller_context::ControllerContext;
use crate::manager::Manager;
use crate::queue::WorkQueue;
use crate::rate_limiter::{ItemExponentialFailureRateLimiter, RateLimiter};
use crate::reconciler::{ReconcileContext, ReconcileResult, Reconciler};
use crate::resource::{Object, ObjectKey};
use crate::source::{EnqueueRequestForObject, EventHandler, EventSource, Predicate};
use crate::status::{StatusUpdate, StatusWriter};
use crate::store::{ObjectStore, StoreError};

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("controller {name} runtime error: {source}")]
    Runtime {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("controller {0} is already registered")]
    AlreadyRegistered(String),

    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig { name: String, reason: String },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Why a single reconcile attempt failed. Every variant is transient and
/// leads to a rate-limited retry.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("store request failed: {0}")]
    Store(#[from] StoreError),

    #[error("reconciler failed: {0}")]
    Policy(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("status of {key} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { key: ObjectKey, attempts: u32 },
}

/// The base trait that all controllers must implement.
///
/// # Lifecycle
///
/// 1. The controller is registered with [`Manager::add`]
/// 2. [`Controller::run`] is called with a cancellation token
/// 3. The controller runs until the token is cancelled or an error occurs
/// 4. [`Controller::shutdown`] is called to clean up resources
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    ///
    /// Used in logs and as the name of its readiness check. Must be unique
    /// within a manager.
    fn name(&self) -> &str;

    /// Runs the controller's main loop.
    ///
    /// Blocks until the cancellation token is triggered or a fatal error
    /// occurs. On cancellation the controller stops gracefully and returns
    /// `Ok(())`.
    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()>;

    /// Optional health check for the controller.
    ///
    /// The default implementation always returns `true`.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }

    /// Optional graceful shutdown hook, called after the main loop exits.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    /// Returns the number of concurrent workers this controller uses.
    fn worker_count(&self) -> usize {
        1
    }
}

struct Inner<R: Reconciler> {
    name: String,
    store: Arc<dyn ObjectStore<R::Object>>,
    reconciler: Arc<R>,
    queue: WorkQueue<ObjectKey>,
    cache: ObjectCache<R::Object>,
    status_writer: StatusWriter<R::Object>,
    workers: usize,
    namespace: Option<String>,
    predicates: Vec<Arc<dyn Predicate<R::Object>>>,
}

/// A controller driving one [`Reconciler`] over one resource kind.
///
/// Built with [`ControllerBuilder`].
pub struct ReconcileController<R: Reconciler> {
    inner: Arc<Inner<R>>,
}

impl<R: Reconciler> fmt::Debug for ReconcileController<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileController")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers)
            .field("namespace", &self.inner.namespace)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl<R: Reconciler> ReconcileController<R> {
    /// Returns the work queue feeding the workers.
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.inner.queue
    }

    /// Returns the object cache maintained by the event source.
    pub fn cache(&self) -> &ObjectCache<R::Object> {
        &self.inner.cache
    }

    /// Reconciles one request outside the worker pool and applies the
    /// resulting queue bookkeeping. The request must not be held by a worker.
    pub async fn reconcile_once(&self, key: &ObjectKey, cancel: &CancellationToken) {
        self.inner.process(key, cancel).await;
    }
}

#[async_trait]
impl<R: Reconciler> Controller for ReconcileController<R> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        tracing::info!(
            controller = %inner.name,
            workers = inner.workers,
            namespace = ?inner.namespace,
            "starting controller"
        );

        let source = EventSource::new(
            inner.name.clone(),
            inner.store.clone(),
            inner.cache.clone(),
            &ctx.config.event_source,
        )
        .with_namespace(inner.namespace.clone())
        .with_predicates(inner.predicates.clone())
        .with_resync_period(ctx.resync_period_fn.clone());

        let handler: Arc<dyn EventHandler<R::Object>> =
            Arc::new(EnqueueRequestForObject::new(inner.queue.clone()));
        let source_task = source.start(handler, cancel.child_token());

        let mut workers = JoinSet::new();
        for id in 0..inner.workers {
            let inner = inner.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { inner.worker(id, cancel).await });
        }

        cancel.cancelled().await;
        tracing::info!(controller = %inner.name, "stopping controller, draining queue");

        if let Err(e) = source_task.await {
            tracing::warn!(controller = %inner.name, error = %e, "event source task failed");
        }
        inner.queue.shut_down();

        let mut panicked = None;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(controller = %inner.name, error = %e, "worker task failed");
                panicked.get_or_insert(e);
            }
        }

        tracing::info!(controller = %inner.name, "controller stopped");
        match panicked {
            Some(e) => Err(ControllerError::Runtime {
                name: inner.name.clone(),
                source: e.into(),
            }),
            None => Ok(()),
        }
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let ready = self.inner.cache.has_synced() && !self.inner.queue.is_shutting_down();
        Box::pin(async move { ready })
    }

    fn worker_count(&self) -> usize {
        self.inner.workers
    }
}

impl<R: Reconciler> Inner<R> {
    async fn worker(&self, id: usize, cancel: CancellationToken) {
        tracing::debug!(controller = %self.name, worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key, &cancel).await;
            self.queue.done(&key);
        }
        tracing::debug!(controller = %self.name, worker = id, "worker stopped");
    }

    /// Reconciles `key` and updates the queue according to the outcome.
    async fn process(&self, key: &ObjectKey, cancel: &CancellationToken) {
        let span = tracing::info_span!("reconcile", controller = %self.name, key = %key);
        async {
            match self.reconcile(key, cancel).await {
                Ok(None) => {
                    tracing::debug!("object not found, nothing to do");
                    self.queue.forget(key);
                }
                Ok(Some(result)) => self.schedule(key, result),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        retries = self.queue.num_requeues(key),
                        "reconcile failed, retrying with backoff"
                    );
                    self.queue.add_rate_limited(key.clone());
                }
            }
        }
        .instrument(span)
        .await
    }

    fn schedule(&self, key: &ObjectKey, result: ReconcileResult) {
        self.queue.forget(key);
        match result.requeue_after.filter(|d| !d.is_zero()) {
            Some(delay) => {
                tracing::debug!(delay_ms = delay.as_millis() as u64, "requeue requested");
                self.queue.add_after(key.clone(), delay);
            }
            None if result.requeue => {
                tracing::debug!("immediate requeue requested");
                self.queue.add(key.clone());
            }
            None => tracing::debug!("reconciled"),
        }
    }

    /// Read, reconcile, write. A conflicting status write restarts the
    /// cycle from a fresh read, up to the configured number of attempts.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<ReconcileResult>, ReconcileError> {
        let max_attempts = self.status_writer.max_attempts();
        let mut attempt = 1;

        loop {
            let current = match self.store.get(key).await {
                Ok(Some(current)) => current,
                Ok(None) => return Ok(None),
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err.into()),
            };

            let ctx = ReconcileContext {
                request: key.clone(),
                attempt: self.queue.num_requeues(key),
                cancel: cancel.clone(),
                cache: self.cache.clone(),
            };
            let outcome = self
                .reconciler
                .reconcile(&ctx, Arc::new(current.clone()))
                .await
                .map_err(|e| ReconcileError::Policy(Box::new(e)))?;

            let Some(status) = outcome.status else {
                return Ok(Some(outcome.result));
            };

            match self.status_writer.update_status(&current, status).await {
                Ok(StatusUpdate::Unchanged) => {
                    tracing::trace!("status already up to date");
                }
                Ok(StatusUpdate::Written(stored)) => {
                    tracing::debug!(
                        resource_version = stored.resource_version().map(|rv| rv.as_str()),
                        "status updated"
                    );
                }
                Ok(StatusUpdate::Gone) => return Ok(None),
                Err(err) if err.is_conflict() => {
                    if attempt >= max_attempts {
                        return Err(ReconcileError::ConflictRetriesExhausted {
                            key: key.clone(),
                            attempts: attempt,
                        });
                    }
                    tracing::debug!(attempt, "status write conflicted, retrying from a fresh read");
                    tokio::time::sleep(self.status_writer.conflict_pause()).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            return Ok(Some(outcome.result));
        }
    }
}

/// Assembles a [`ReconcileController`].
///
/// ```rust,ignore
/// ControllerBuilder::new("frigate", store, FrigateReconciler)
///     .with_predicate(GenerationChangedPredicate)
///     .setup_with_manager(&mut manager)?;
/// ```
pub struct ControllerBuilder<R: Reconciler> {
    name: String,
    store: Arc<dyn ObjectStore<R::Object>>,
    reconciler: R,
    workers: Option<usize>,
    namespace: Option<String>,
    predicates: Vec<Arc<dyn Predicate<R::Object>>>,
    rate_limiter: Option<Box<dyn RateLimiter<ObjectKey>>>,
}

impl<R: Reconciler> fmt::Debug for ControllerBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBuilder")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("namespace", &self.namespace)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl<R: Reconciler> ControllerBuilder<R> {
    /// Starts a controller named `name` reconciling objects of `store`.
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore<R::Object>>, reconciler: R) -> Self {
        Self {
            name: name.into(),
            store,
            reconciler,
            workers: None,
            namespace: None,
            predicates: Vec::new(),
            rate_limiter: None,
        }
    }

    /// Number of concurrent workers. Defaults to `generic.concurrentReconciles`.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Watches a single namespace. Defaults to `generic.namespace`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Adds an event predicate.
    pub fn with_predicate(mut self, predicate: impl Predicate<R::Object>) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Replaces the retry rate limiter built from `rateLimiter`.
    pub fn rate_limiter(mut self, rate_limiter: impl RateLimiter<ObjectKey>) -> Self {
        self.rate_limiter = Some(Box::new(rate_limiter));
        self
    }

    /// Builds the controller, filling unset options from `config`.
    pub fn build(self, config: &ManagerConfig) -> Result<ReconcileController<R>> {
        let workers = self.workers.unwrap_or(config.generic.concurrent_reconciles);
        if workers == 0 {
            return Err(ControllerError::InvalidConfig {
                name: self.name,
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.name.is_empty() {
            return Err(ControllerError::InvalidConfig {
                name: self.name,
                reason: "controller name must not be empty".to_string(),
            });
        }

        let rate_limiter: Box<dyn RateLimiter<ObjectKey>> = match self.rate_limiter {
            Some(rate_limiter) => rate_limiter,
            None => Box::new(ItemExponentialFailureRateLimiter::from_config(&config.rate_limiter)),
        };
        let queue = WorkQueue::with_rate_limiter(self.name.clone(), rate_limiter);
        let status_writer = StatusWriter::new(self.store.clone(), &config.status_writer);

        Ok(ReconcileController {
            inner: Arc::new(Inner {
                namespace: self.namespace.or_else(|| config.generic.namespace.clone()),
                name: self.name,
                store: self.store,
                reconciler: Arc::new(self.reconciler),
                queue,
                cache: ObjectCache::new(),
                status_writer,
                workers,
                predicates: self.predicates,
            }),
        })
    }

    /// Builds the controller from the manager's configuration and registers it.
    pub fn setup_with_manager(self, manager: &mut Manager) -> Result<Arc<ReconcileController<R>>> {
        let controller = Arc::new(self.build(manager.config())?);
        manager.add(controller.clone())?;
        Ok(controller)
    }
}
