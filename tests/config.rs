//! Loading a manager configuration and wiring controllers from it.

use std::sync::Arc;
use std::time::Duration;

use controller_runtime_rust::config::ManagerConfig;
use controller_runtime_rust::controller::Controller;
use controller_runtime_rust::frigate::{Frigate, FrigateReconciler, FrigateSpec, FrigateStatus};
use controller_runtime_rust::manager::Manager;
use controller_runtime_rust::store::MemoryStore;

const CONFIG: &str = r#"
generic:
  namespace: fleet
  concurrentReconciles: 3
  shutdownTimeout: 15s
  resyncPeriod: 10m
rateLimiter:
  baseDelay: 20ms
  maxDelay: 30s
statusWriter:
  conflictRetries: 8
  conflictBackoff: 5ms
eventSource:
  relistInitialBackoff: 250ms
  relistMaxBackoff: 1m
"#;

#[test]
fn test_config_parsing() {
    let config: ManagerConfig = serde_yaml::from_str(CONFIG).unwrap();
    assert!(config.validate().is_ok());

    assert_eq!(config.generic.namespace.as_deref(), Some("fleet"));
    assert_eq!(config.generic.concurrent_reconciles, 3);
    assert_eq!(config.generic.shutdown_timeout, Duration::from_secs(15));
    assert_eq!(config.generic.resync_period, Some(Duration::from_secs(600)));
    assert!(config.generic.health_probe_bind_address.is_none());
    assert_eq!(config.rate_limiter.base_delay, Duration::from_millis(20));
    assert_eq!(config.rate_limiter.max_delay, Duration::from_secs(30));
    assert_eq!(config.status_writer.conflict_retries, 8);
    assert_eq!(config.status_writer.conflict_backoff, Duration::from_millis(5));
    assert_eq!(config.event_source.relist_initial_backoff, Duration::from_millis(250));
    assert_eq!(config.event_source.relist_max_backoff, Duration::from_secs(60));
}

#[test]
fn test_config_round_trips_through_yaml() {
    let config: ManagerConfig = serde_yaml::from_str(CONFIG).unwrap();
    let rendered = serde_yaml::to_string(&config).unwrap();
    assert!(rendered.contains("concurrentReconciles: 3"));

    let reparsed: ManagerConfig = serde_yaml::from_str(&rendered).unwrap();
    assert_eq!(reparsed.generic.resync_period, config.generic.resync_period);
    assert_eq!(reparsed.rate_limiter.base_delay, config.rate_limiter.base_delay);
}

#[test]
fn test_unknown_duration_is_rejected() {
    let err = serde_yaml::from_str::<ManagerConfig>("rateLimiter:\n  baseDelay: soon\n");
    assert!(err.is_err());
}

#[test]
fn test_controller_takes_settings_from_config() {
    let config: ManagerConfig = serde_yaml::from_str(CONFIG).unwrap();
    let mut manager = Manager::new(config);
    let store = MemoryStore::<FrigateSpec, FrigateStatus>::new();

    let controller = FrigateReconciler::setup_with_manager(Arc::new(store), &mut manager).unwrap();

    assert_eq!(controller.worker_count(), 3);
    assert_eq!(controller.name(), FrigateReconciler::NAME);
    assert_eq!(manager.controller_names(), vec![FrigateReconciler::NAME]);
}

#[test]
fn test_manifest_format() {
    let manifest = r#"
- metadata:
    name: some
    namespace: default
  spec:
    foo: foo
- metadata:
    name: another
    namespace: default
  spec:
    foo: ""
"#;
    let objects: Vec<Frigate> = serde_yaml::from_str(manifest).unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].spec.foo, "foo");
    assert!(objects[1].spec.foo.is_empty());
    assert!(objects.iter().all(|o| o.status.is_none()));
}
