//! End-to-end behavior of the Frigate controller against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, test_config, Running};
use controller_runtime_rust::frigate::{phase, Frigate, FrigateReconciler, FrigateSpec, FrigateStatus, Phase};
use controller_runtime_rust::manager::Manager;
use controller_runtime_rust::resource::ObjectKey;
use controller_runtime_rust::store::{MemoryStore, ObjectStore, Operation, StoreError};

type Store = MemoryStore<FrigateSpec, FrigateStatus>;

fn frigate(name: &str, foo: &str) -> Frigate {
    Frigate::new(
        "default",
        name,
        FrigateSpec {
            foo: foo.to_string(),
        },
    )
}

fn start(store: &Store, config: controller_runtime_rust::ManagerConfig) -> Running {
    let mut manager = Manager::new(config);
    FrigateReconciler::setup_with_manager(Arc::new(store.clone()), &mut manager).unwrap();
    Running::start(manager)
}

async fn wait_for_phase(store: &Store, key: &ObjectKey) -> Phase {
    eventually("a terminal phase", || async move {
        let obj = store.get(key).await.unwrap()?;
        match phase(&obj) {
            Phase::Pending => None,
            terminal => Some(terminal),
        }
    })
    .await
}

async fn wait_until(store: &Store, key: &ObjectKey, what: &str, check: impl Fn(&Frigate) -> bool) {
    let check = &check;
    eventually(what, || async move {
        let obj = store.get(key).await.unwrap()?;
        check(&obj).then_some(())
    })
    .await
}

#[tokio::test]
async fn test_foo_set_reaches_completed() {
    let store = Store::new();
    let running = start(&store, test_config());

    store.create(frigate("some", "foo")).await.unwrap();
    let key = ObjectKey::new("default", "some");
    assert_eq!(wait_for_phase(&store, &key).await, Phase::Completed);

    let stored = store.get(&key).await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.observed_generation, 1);
    assert!(status.message.is_none());

    running.stop().await;
}

#[tokio::test]
async fn test_empty_foo_reaches_failure() {
    let store = Store::new();
    let running = start(&store, test_config());

    store.create(frigate("another", "")).await.unwrap();
    let key = ObjectKey::new("default", "another");
    assert_eq!(wait_for_phase(&store, &key).await, Phase::Failure);

    // A business failure is not retried.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.stats().status_updates, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_object_deleted_before_first_reconcile() {
    let store = Store::new();
    let mut manager = Manager::new(test_config());
    let controller =
        FrigateReconciler::setup_with_manager(Arc::new(store.clone()), &mut manager).unwrap();

    let key = ObjectKey::new("default", "doomed");
    store.create(frigate("doomed", "foo")).await.unwrap();
    controller.queue().add(key.clone());
    store.delete(&key).await.unwrap();

    let running = Running::start(manager);
    let (watched, request) = (&controller, &key);
    eventually("the request to be processed", || async move {
        let idle = watched.cache().has_synced()
            && watched.queue().is_empty()
            && !watched.queue().is_processing(request);
        idle.then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.stats().status_updates, 0);
    assert_eq!(controller.queue().num_requeues(&key), 0);
    assert_eq!(controller.queue().waiting_len(), 0);
    assert!(store.get(&key).await.unwrap().is_none());

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_write_error_is_retried_after_backoff() {
    let base_delay = Duration::from_millis(200);
    let mut config = test_config();
    config.rate_limiter.base_delay = base_delay;

    let store = Store::new();
    store.create(frigate("flaky", "foo")).await.unwrap();
    store.fail_next(Operation::UpdateStatus, StoreError::Unavailable("etcd leader lost".into()));

    let started = tokio::time::Instant::now();
    let running = start(&store, config);

    let key = ObjectKey::new("default", "flaky");
    assert_eq!(wait_for_phase(&store, &key).await, Phase::Completed);

    let elapsed = started.elapsed();
    assert!(elapsed >= base_delay, "retried too early: {elapsed:?}");
    assert!(elapsed < base_delay * 2, "retried too late: {elapsed:?}");
    assert_eq!(store.stats().status_updates, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_converged_object_is_not_rewritten() {
    let mut config = test_config();
    config.generic.resync_period = Some(Duration::from_millis(30));
    let store = Store::new();
    let running = start(&store, config);

    store.create(frigate("steady", "foo")).await.unwrap();
    let key = ObjectKey::new("default", "steady");
    wait_for_phase(&store, &key).await;
    let version = store.get(&key).await.unwrap().unwrap().metadata.resource_version;

    // Several periodic resyncs reconcile the object again.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.stats().status_updates, 1);
    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.metadata.resource_version, version);

    running.stop().await;
}

#[tokio::test]
async fn test_spec_change_is_reconciled() {
    let store = Store::new();
    let running = start(&store, test_config());

    store.create(frigate("some", "foo")).await.unwrap();
    let key = ObjectKey::new("default", "some");
    assert_eq!(wait_for_phase(&store, &key).await, Phase::Completed);

    let mut obj = store.get(&key).await.unwrap().unwrap();
    obj.spec.foo.clear();
    store.update(obj).await.unwrap();

    wait_until(&store, &key, "the failure phase", |obj| {
        obj.status
            .as_ref()
            .is_some_and(|s| s.phase == Phase::Failure && s.observed_generation == 2)
    })
    .await;

    running.stop().await;
}

#[tokio::test]
async fn test_changes_during_store_restart_are_resynced() {
    let store = Store::new();
    let running = start(&store, test_config());

    store.create(frigate("some", "foo")).await.unwrap();
    let key = ObjectKey::new("default", "some");
    assert_eq!(wait_for_phase(&store, &key).await, Phase::Completed);

    // Writes racing the restart may never be seen on a watch; the relist
    // must still pick them up.
    store.restart();
    let mut obj = store.get(&key).await.unwrap().unwrap();
    obj.spec.foo.clear();
    store.update(obj).await.unwrap();
    store.create(frigate("late", "bar")).await.unwrap();

    wait_until(&store, &key, "the changed object to fail", |obj| {
        phase(obj) == Phase::Failure
    })
    .await;
    assert_eq!(
        wait_for_phase(&store, &ObjectKey::new("default", "late")).await,
        Phase::Completed
    );

    running.stop().await;
}

#[tokio::test]
async fn test_namespace_restriction() {
    let mut config = test_config();
    config.generic.namespace = Some("watched".to_string());
    let store = Store::new();
    let running = start(&store, config);

    store
        .create(Frigate::new("watched", "in", FrigateSpec { foo: "x".into() }))
        .await
        .unwrap();
    store
        .create(Frigate::new("ignored", "out", FrigateSpec { foo: "x".into() }))
        .await
        .unwrap();

    assert_eq!(
        wait_for_phase(&store, &ObjectKey::new("watched", "in")).await,
        Phase::Completed
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ignored = store.get(&ObjectKey::new("ignored", "out")).await.unwrap().unwrap();
    assert_eq!(phase(&ignored), Phase::Pending);

    running.stop().await;
}
