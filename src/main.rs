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

//! frigate-controller - runs the Frigate reconciler against an in-memory store.
//!
//! Objects listed in `--manifest` are created at startup; the controller
//! reconciles them until SIGINT or SIGTERM.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use controller_runtime_rust::config::ManagerConfig;
use controller_runtime_rust::frigate::{Frigate, FrigateReconciler, FrigateSpec, FrigateStatus};
use controller_runtime_rust::manager::Manager;
use controller_runtime_rust::store::{MemoryStore, ObjectStore};

/// Frigate controller
///
/// Watches Frigate objects and records in their status whether their spec
/// can be satisfied.
#[derive(Parser, Debug)]
#[command(name = "frigate-controller")]
#[command(version)]
#[command(about = "Frigate controller", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML list of Frigate objects to create at startup
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Number of concurrent reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Address of the health probe server, e.g. 0.0.0.0:8081
    #[arg(long)]
    health_probe_bind_address: Option<String>,

    /// Namespace to watch. All namespaces when unset
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!(version = controller_runtime_rust::VERSION, "starting frigate-controller");

    let manifest = args.manifest.clone();
    let config = load_config(args).await?;
    info!(
        workers = config.generic.concurrent_reconciles,
        namespace = ?config.generic.namespace,
        "configuration loaded"
    );

    let store = MemoryStore::<FrigateSpec, FrigateStatus>::new();
    if let Some(path) = manifest {
        apply_manifest(&store, &path).await?;
    }

    let mut manager = Manager::new(config);
    FrigateReconciler::setup_with_manager(Arc::new(store), &mut manager)
        .context("failed to set up frigate controller")?;

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!(error = %e, "failed to listen for shutdown signals");
        }
        signal_stop.cancel();
    });

    if let Err(e) = manager.start(stop).await {
        error!("manager failed: {:#}", e);
        return Err(e.into());
    }

    info!("frigate-controller exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {level}"))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .try_init()?;
    }
    Ok(())
}

/// Loads the configuration from file and applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<ManagerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<ManagerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        ManagerConfig::default()
    };

    if let Some(workers) = args.workers {
        config.generic.concurrent_reconciles = workers;
    }
    if let Some(address) = args.health_probe_bind_address {
        config.generic.health_probe_bind_address = Some(address);
    }
    if let Some(namespace) = args.namespace {
        config.generic.namespace = Some(namespace);
    }

    config
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid configuration: {reason}"))?;
    Ok(config)
}

/// Creates every Frigate listed in the manifest file.
async fn apply_manifest(
    store: &MemoryStore<FrigateSpec, FrigateStatus>,
    path: &Path,
) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read manifest: {:?}", path))?;
    let objects: Vec<Frigate> = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse manifest: {:?}", path))?;

    for mut obj in objects {
        obj.metadata.resource_version = None;
        let key = obj.metadata.key();
        store
            .create(obj)
            .await
            .with_context(|| format!("failed to create {key}"))?;
        info!(key = %key, "created frigate from manifest");
    }
    Ok(())
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("received Ctrl+C, shutting down");
    }

    Ok(())
}
