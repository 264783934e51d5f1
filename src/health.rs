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

//! Health check support.
//!
//! Serves liveness and readiness probes for the manager:
//!
//! - `/healthz`: the process is up
//! - `/readyz`: every registered checker reports healthy, 503 otherwise
//! - `/readyz/verbose`: per-check detail as JSON

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, HealthStatus>,
}

/// Health checker trait.
///
/// Components implement this trait to provide custom health checks.
pub trait HealthChecker: Send + Sync + 'static {
    /// Performs a health check. Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    name: String,
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    /// Creates a new function-based health checker.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin((self.check_fn)())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Health check registry.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker, replacing any checker of the same name.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        let mut checkers = self.checkers.write().await;
        checkers.retain(|c| c.name() != checker.name());
        checkers.push(checker);
    }

    /// Removes a health checker by name.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut checkers = self.checkers.write().await;
        let original_len = checkers.len();
        checkers.retain(|c| c.name() != name);
        checkers.len() < original_len
    }

    /// Runs all health checks and returns the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await.clone();
        let mut checks = BTreeMap::new();
        let mut overall_healthy = true;

        for checker in checkers {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(checker.name().to_string(), healthy.into());
        }

        HealthCheck {
            status: overall_healthy.into(),
            checks,
        }
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Health probe server.
pub struct HealthServer {
    listener: TcpListener,
    registry: HealthRegistry,
}

impl HealthServer {
    /// Binds `bind_address` for serving `registry`.
    pub async fn bind(bind_address: &str, registry: HealthRegistry) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        Ok(Self { listener, registry })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves the probe endpoints until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    handle_request(req, registry.clone())
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    tracing::debug!(error = %e, "health probe connection failed");
                }
            });
        }

        tracing::info!("health probe server stopped");
        Ok(())
    }
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<Incoming>,
    registry: HealthRegistry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/healthz" => response(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            let result = registry.check_all().await;
            if result.status == HealthStatus::Healthy {
                response(StatusCode::OK, "text/plain", "ok")
            } else {
                response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        }
        "/readyz/verbose" => {
            let result = registry.check_all().await;
            let status = match result.status {
                HealthStatus::Healthy => StatusCode::OK,
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            response(status, "application/json", json)
        }
        _ => response(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };

    Ok(response)
}
