//! Concurrency guarantees of the reconcile loop: single-flight per object,
//! coalescing of mid-flight changes and conflict-safe status writes.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, test_config, Running};
use controller_runtime_rust::controller::ControllerBuilder;
use controller_runtime_rust::manager::Manager;
use controller_runtime_rust::reconciler::{ReconcileContext, ReconcileResult, Reconciler, Reconciliation};
use controller_runtime_rust::resource::{ObjectKey, Resource};
use controller_runtime_rust::store::{MemoryStore, ObjectStore, StoreError};
use tokio::sync::Notify;

type Thing = Resource<String, String>;
type Store = MemoryStore<String, String>;

#[derive(Default)]
struct Probe {
    in_flight: Mutex<HashSet<ObjectKey>>,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
    started: Notify,
}

/// Copies the spec into the status after a delay, recording overlapping
/// reconciles of the same object.
struct SlowEcho {
    delay: Duration,
    probe: Arc<Probe>,
}

#[async_trait]
impl Reconciler for SlowEcho {
    type Object = Thing;
    type Error = std::convert::Infallible;

    async fn reconcile(
        &self,
        ctx: &ReconcileContext<Thing>,
        obj: Arc<Thing>,
    ) -> Result<Reconciliation<String>, Self::Error> {
        if !self.probe.in_flight.lock().unwrap().insert(ctx.request.clone()) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        self.probe.started.notify_one();

        tokio::time::sleep(self.delay).await;

        self.probe.in_flight.lock().unwrap().remove(&ctx.request);
        Ok(Reconciliation::status(obj.spec.clone()))
    }
}

fn start(store: &Store, workers: usize, delay: Duration) -> (Running, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let reconciler = SlowEcho {
        delay,
        probe: probe.clone(),
    };
    let mut manager = Manager::new(test_config());
    let shared: Arc<dyn ObjectStore<Thing>> = Arc::new(store.clone());
    ControllerBuilder::new("echo", shared, reconciler)
        .workers(workers)
        .setup_with_manager(&mut manager)
        .unwrap();
    (Running::start(manager), probe)
}

/// Writes a new spec, retrying when a status write got in between.
async fn set_spec(store: &Store, key: &ObjectKey, spec: &str) {
    loop {
        let mut obj = store.get(key).await.unwrap().unwrap();
        obj.spec = spec.to_string();
        match store.update(obj).await {
            Ok(_) => return,
            Err(StoreError::Conflict { .. }) => continue,
            Err(e) => panic!("unexpected update error: {e}"),
        }
    }
}

async fn wait_for_status(store: &Store, key: &ObjectKey, expected: &str) {
    eventually("the status to match", || async move {
        let obj = store.get(key).await.unwrap()?;
        (obj.status.as_deref() == Some(expected)).then_some(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_under_rapid_mutation() {
    let store = Store::new();
    let (running, probe) = start(&store, 4, Duration::from_millis(5));

    let key = ObjectKey::new("default", "hot");
    store.create(Resource::new("default", "hot", "v0".to_string())).await.unwrap();
    for other in ["a", "b", "c"] {
        store
            .create(Resource::new("default", other, other.to_string()))
            .await
            .unwrap();
    }

    for i in 1..=20 {
        set_spec(&store, &key, &format!("v{i}")).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    wait_for_status(&store, &key, "v20").await;
    for other in ["a", "b", "c"] {
        wait_for_status(&store, &ObjectKey::new("default", other), other).await;
    }

    assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);
    running.stop().await;
}

#[tokio::test]
async fn test_change_during_reconcile_triggers_another_pass() {
    let store = Store::new();
    let (running, probe) = start(&store, 2, Duration::from_millis(50));

    let key = ObjectKey::new("default", "x");
    store.create(Resource::new("default", "x", "v1".to_string())).await.unwrap();

    probe.started.notified().await;
    let calls_before = probe.calls.load(Ordering::SeqCst);
    set_spec(&store, &key, "v2").await;

    wait_for_status(&store, &key, "v2").await;
    assert!(probe.calls.load(Ordering::SeqCst) > calls_before);
    assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_racing_spec_write_is_not_lost() {
    let store = Store::new();
    let (running, probe) = start(&store, 1, Duration::from_millis(50));

    let key = ObjectKey::new("default", "x");
    store.create(Resource::new("default", "x", "v1".to_string())).await.unwrap();

    // Wait until the first reconcile has read v1, then change the spec
    // underneath it. Its status write must conflict and be recomputed.
    eventually("the first reconcile to start", || {
        let probe = probe.clone();
        async move { (probe.calls.load(Ordering::SeqCst) > 0).then_some(()) }
    })
    .await;
    set_spec(&store, &key, "v2").await;

    wait_for_status(&store, &key, "v2").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.spec, "v2");
    assert_eq!(stored.status.as_deref(), Some("v2"));
    assert_eq!(stored.metadata.generation, 2);

    running.stop().await;
}

/// Requeues a fixed number of times before converging.
struct Countdown {
    remaining: AtomicUsize,
    after: Option<Duration>,
}

#[async_trait]
impl Reconciler for Countdown {
    type Object = Thing;
    type Error = std::convert::Infallible;

    async fn reconcile(
        &self,
        _ctx: &ReconcileContext<Thing>,
        _obj: Arc<Thing>,
    ) -> Result<Reconciliation<String>, Self::Error> {
        let left = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if left == 0 {
            return Ok(Reconciliation::status("done".to_string()));
        }
        let result = match self.after {
            Some(delay) => ReconcileResult::requeue_after(delay),
            None => ReconcileResult::requeue(),
        };
        Ok(Reconciliation::status(format!("waiting {left}")).with_result(result))
    }
}

async fn run_countdown(after: Option<Duration>) -> Store {
    let store = Store::new();
    let mut manager = Manager::new(test_config());
    let reconciler = Countdown {
        remaining: AtomicUsize::new(3),
        after,
    };
    let shared: Arc<dyn ObjectStore<Thing>> = Arc::new(store.clone());
    ControllerBuilder::new("countdown", shared, reconciler)
        .setup_with_manager(&mut manager)
        .unwrap();
    let running = Running::start(manager);

    store.create(Resource::new("default", "x", String::new())).await.unwrap();
    wait_for_status(&store, &ObjectKey::new("default", "x"), "done").await;

    running.stop().await;
    store
}

#[tokio::test]
async fn test_requeue_runs_again_until_done() {
    let store = run_countdown(None).await;
    assert_eq!(store.stats().status_updates, 4);
}

#[tokio::test]
async fn test_requeue_after_runs_again_until_done() {
    let store = run_countdown(Some(Duration::from_millis(20))).await;
    assert_eq!(store.stats().status_updates, 4);
}

#[tokio::test]
async fn test_duplicate_controller_names_are_rejected() {
    let store = Store::new();
    let mut manager = Manager::new(test_config());
    let probe = Arc::new(Probe::default());
    let store_handle: Arc<dyn ObjectStore<Thing>> = Arc::new(store.clone());

    ControllerBuilder::new(
        "echo",
        store_handle.clone(),
        SlowEcho {
            delay: Duration::ZERO,
            probe: probe.clone(),
        },
    )
    .setup_with_manager(&mut manager)
    .unwrap();

    let err = ControllerBuilder::new("echo", store_handle, SlowEcho { delay: Duration::ZERO, probe })
        .setup_with_manager(&mut manager)
        .unwrap_err();
    assert!(err.to_string().contains("already registered"));
}

#[tokio::test]
async fn test_stop_lets_in_flight_reconcile_persist() {
    let store = Store::new();
    let (running, probe) = start(&store, 1, Duration::from_millis(200));

    let key = ObjectKey::new("default", "x");
    store.create(Resource::new("default", "x", "v1".to_string())).await.unwrap();

    probe.started.notified().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopping = std::time::Instant::now();
    running.stop().await;
    let took = stopping.elapsed();

    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.status.as_deref(), Some("v1"));
    assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);
    // The remaining ~150ms of the reconcile, well short of shutdownTimeout.
    assert!(took < Duration::from_secs(2), "stop took {took:?}");
}
