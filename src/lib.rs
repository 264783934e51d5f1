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

//! controller-runtime-rust - a reconciliation controller runtime
//!
//! This library provides the pieces of a level-triggered controller:
//! - An object model with optimistic concurrency and a store contract
//! - Event sources that turn watch notifications into reconcile requests
//! - A deduplicating, rate-limited work queue
//! - Reconcile workers with conflict-safe status writes
//! - A manager owning controller lifecycle and health probes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod frigate;
pub mod health;
pub mod manager;
pub mod queue;
pub mod rate_limiter;
pub mod reconciler;
pub mod resource;
pub mod source;
pub mod status;
pub mod store;

// Re-export commonly used types
pub use config::ManagerConfig;
pub use controller::{Controller, ControllerBuilder, ControllerError, ReconcileController, ReconcileError};
pub use controller_context::ControllerContext;
pub use manager::Manager;
pub use queue::WorkQueue;
pub use reconciler::{ReconcileContext, ReconcileResult, Reconciler, Reconciliation};
pub use resource::{HasStatus, Object, ObjectKey, ObjectMeta, Resource, ResourceVersion};
pub use store::{MemoryStore, ObjectStore, StoreError};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
