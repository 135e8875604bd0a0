// Integration tests for the instance launcher, driven through the registry

mod common;

use common::{
    cloud_instances, count, count_by_status, linked_cloud_ids, new_registry, ScriptedProvider,
};
use nodepool_common::{Instance, InstanceStatus};
use nodepool_orchestrator::config::LauncherConfig;
use nodepool_orchestrator::instance_launcher::{
    InstanceLauncher, LaunchError, LaunchWorker, LauncherClosed,
};
use nodepool_orchestrator::instance_registry::InstanceRegistry;
use nodepool_providers::mock::MockProvider;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn claimed(worker: &LaunchWorker, registry: &InstanceRegistry, instance_type: &str, n: usize) -> Vec<Instance> {
    registry.request_instances(instance_type, n);
    let claimed = worker.claim_new_instances();
    assert_eq!(claimed.len(), n);
    claimed
}

#[tokio::test]
async fn test_all_requested_nodes_are_allocated() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(2, 5));

    registry.request_instances("small", 3);
    launcher.flush().await.unwrap();

    assert_eq!(count(&registry, InstanceStatus::Allocated), 3);
    assert_eq!(provider.create_calls(), vec![("small".to_string(), 3)]);
    for instance in registry.get_instances(&[]).values() {
        assert!(instance.is_linked());
        assert!(instance.internal_ip.is_some());
    }
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_fulfilment_fails_the_rest() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new().with_quota("gpu", 2));
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(1, 5));

    registry.request_instances("gpu", 5);
    launcher.flush().await.unwrap();

    let counts = count_by_status(&registry);
    assert_eq!(counts.get(&InstanceStatus::Allocated), Some(&2));
    assert_eq!(counts.get(&InstanceStatus::AllocationFailed), Some(&3));
    assert!(provider.terminated_ids().is_empty());
    for failed in registry.get_instances(&[InstanceStatus::AllocationFailed]).values() {
        assert!(!failed.is_linked());
    }
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_requests_are_chunked_per_type() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(3, 5));

    registry.request_instances("small", 7);
    registry.request_instances("gpu", 3);
    launcher.flush().await.unwrap();

    let mut calls = provider.create_calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            ("gpu".to_string(), 3),
            ("small".to_string(), 2),
            ("small".to_string(), 5),
        ]
    );
    assert_eq!(count(&registry, InstanceStatus::Allocated), 10);
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_instances_requested_before_start_are_launched() {
    let registry = new_registry();
    registry.request_instances("small", 2);

    let provider = Arc::new(MockProvider::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider, LauncherConfig::default());
    launcher.flush().await.unwrap();

    assert_eq!(count(&registry, InstanceStatus::Allocated), 2);
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_record_changed_after_claim_is_dropped() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::new(1, 5));

    let instances = claimed(&worker, &registry, "small", 3);
    // Another writer touches one record between claim and launch.
    let touched = registry.get_instance(&instances[0].id).unwrap();
    assert!(registry.upsert_instance(&touched, Some(touched.version)).is_applied());

    let summary = worker
        .launch_new_instances_by_type("small", instances.clone())
        .await
        .unwrap();

    assert_eq!(summary.dropped, vec![instances[0].id]);
    assert_eq!(summary.requested, 2);
    assert_eq!(summary.allocated.len(), 2);
    assert_eq!(provider.create_calls(), vec![("small".to_string(), 2)]);
    assert_eq!(
        registry.get_instance(&instances[0].id).unwrap().status,
        InstanceStatus::Queued
    );
}

#[tokio::test]
async fn test_cancelled_during_create_frees_its_cloud_instance() {
    let registry = new_registry();
    let worker_registry = registry.clone();
    let target = Arc::new(std::sync::Mutex::new(None));
    let hook_target = target.clone();

    let provider = Arc::new(ScriptedProvider::new(move |_, n| {
        // Cancel one record while the provider call is in flight.
        let id = hook_target.lock().unwrap().expect("target set before launch");
        let mut record: Instance = worker_registry.get_instance(&id).unwrap();
        let expected = record.version;
        record.status = InstanceStatus::Terminating;
        assert!(worker_registry.upsert_instance(&record, Some(expected)).is_applied());
        Ok(cloud_instances(n))
    }));
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::new(1, 5));

    let instances = claimed(&worker, &registry, "small", 3);
    *target.lock().unwrap() = Some(instances[1].id);

    let summary = worker
        .launch_new_instances_by_type("small", instances.clone())
        .await
        .unwrap();

    assert_eq!(summary.created, 3);
    assert_eq!(summary.allocated.len(), 2);
    assert_eq!(summary.abandoned, vec![instances[1].id]);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.terminated.len(), 1);
    assert_eq!(summary.accounted_cloud_instances(), summary.created);

    let cancelled = registry.get_instance(&instances[1].id).unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Terminating);
    assert!(!cancelled.is_linked());
    // The released node is not linked anywhere.
    let linked: HashSet<String> = linked_cloud_ids(&registry).into_iter().collect();
    assert!(!linked.contains(&summary.terminated[0]));
}

#[tokio::test]
async fn test_provider_failure_leaves_records_requested() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    provider.fail_creates_for("gpu");
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::new(1, 5));

    let instances = claimed(&worker, &registry, "gpu", 2);
    let err = worker
        .launch_new_instances_by_type("gpu", instances)
        .await
        .unwrap_err();

    assert!(matches!(err, LaunchError::Provider { requested: 2, .. }));
    assert_eq!(count(&registry, InstanceStatus::Requested), 2);
    assert!(provider.terminated_ids().is_empty());
}

#[tokio::test]
async fn test_provider_failure_through_launcher() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    provider.fail_creates_for("gpu");
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::default());

    registry.request_instances("gpu", 2);
    registry.request_instances("small", 1);
    launcher.flush().await.unwrap();

    assert_eq!(count(&registry, InstanceStatus::Requested), 2);
    assert_eq!(count(&registry, InstanceStatus::Allocated), 1);
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_surplus_nodes_are_terminated() {
    let registry = new_registry();
    let provider = Arc::new(ScriptedProvider::returning(5));
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::new(1, 5));

    let instances = claimed(&worker, &registry, "small", 2);
    let summary = worker
        .launch_new_instances_by_type("small", instances)
        .await
        .unwrap();

    assert_eq!(summary.created, 5);
    assert_eq!(summary.allocated.len(), 2);
    assert_eq!(summary.terminated.len(), 3);
    assert_eq!(provider.terminated_ids().len(), 3);
    assert_eq!(summary.accounted_cloud_instances(), 5);
}

#[tokio::test]
async fn test_termination_failure_is_reported_not_retried() {
    let registry = new_registry();
    let provider = Arc::new(ScriptedProvider::returning(3).failing_terminates());
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::new(1, 5));

    let instances = claimed(&worker, &registry, "small", 1);
    let summary = worker
        .launch_new_instances_by_type("small", instances)
        .await
        .unwrap();

    assert!(summary.termination_failed);
    assert_eq!(summary.terminated.len(), 2);
    assert_eq!(provider.terminate_calls(), 1);
    assert_eq!(count(&registry, InstanceStatus::Allocated), 1);
}

#[tokio::test]
async fn test_stale_chunk_makes_no_provider_call() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::new(1, 5));

    let instances = claimed(&worker, &registry, "small", 2);
    for instance in &instances {
        let current = registry.get_instance(&instance.id).unwrap();
        assert!(registry.upsert_instance(&current, Some(current.version)).is_applied());
    }

    let summary = worker
        .launch_new_instances_by_type("small", instances)
        .await
        .unwrap();
    assert_eq!(summary.dropped.len(), 2);
    assert_eq!(summary.requested, 0);
    assert!(provider.create_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_are_bounded() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new().with_latency(Duration::from_millis(50)));
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(2, 1));

    registry.request_instances("small", 6);
    launcher.flush().await.unwrap();

    assert_eq!(provider.create_calls().len(), 6);
    assert_eq!(provider.max_concurrent_creates(), 2);
    assert_eq!(count(&registry, InstanceStatus::Allocated), 6);
    launcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_launchers_never_double_claim() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let a = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(2, 3));
    let b = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(2, 3));

    for _ in 0..10 {
        registry.request_instances("small", 2);
    }
    a.flush().await.unwrap();
    b.flush().await.unwrap();

    assert_eq!(count(&registry, InstanceStatus::Allocated), 20);
    let requested: usize = provider.create_calls().iter().map(|(_, n)| n).sum();
    assert_eq!(requested, 20);
    assert_eq!(provider.created_count(), 20);

    let linked = linked_cloud_ids(&registry);
    let unique: HashSet<_> = linked.iter().collect();
    assert_eq!(unique.len(), 20);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_terminal_records_are_left_alone() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new().with_quota("small", 1));
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::default());

    registry.request_instances("small", 2);
    launcher.flush().await.unwrap();
    let before = registry.get_instances(&[]);
    let calls = provider.create_calls().len();

    launcher.request_reconcile().unwrap();
    launcher.flush().await.unwrap();

    assert_eq!(registry.get_instances(&[]), before);
    assert_eq!(provider.create_calls().len(), calls);
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retried_record_is_launched_again() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new().with_quota("small", 0));
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::default());

    let id = registry.request_instances("small", 1)[0].id;
    launcher.flush().await.unwrap();
    let mut failed = registry.get_instance(&id).unwrap();
    assert_eq!(failed.status, InstanceStatus::AllocationFailed);

    // Scaling policy asks for a retry.
    let expected = failed.version;
    failed.transition_to(InstanceStatus::Unknown).unwrap();
    assert!(registry.upsert_instance(&failed, Some(expected)).is_applied());
    launcher.flush().await.unwrap();

    assert_eq!(provider.create_calls().len(), 2);
    assert_eq!(
        registry.get_instance(&id).unwrap().status,
        InstanceStatus::AllocationFailed
    );
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_launching() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::default());
    launcher.shutdown().await.unwrap();

    registry.request_instances("small", 2);
    assert_eq!(launcher.request_reconcile(), Err(LauncherClosed));
    assert_eq!(count(&registry, InstanceStatus::Unknown), 2);
    assert!(provider.create_calls().is_empty());
}

#[tokio::test]
async fn test_three_small_in_chunks_of_two() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(2, 2));

    registry.request_instances("small", 3);
    launcher.flush().await.unwrap();

    let mut calls = provider.create_calls();
    calls.sort();
    assert_eq!(calls, vec![("small".to_string(), 1), ("small".to_string(), 2)]);
    assert_eq!(count(&registry, InstanceStatus::Allocated), 3);
    assert!(provider.terminate_calls().is_empty());
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_gpu_with_one_created() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new().with_quota("gpu", 1));
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::default());

    registry.request_instances("gpu", 2);
    launcher.flush().await.unwrap();

    assert_eq!(provider.create_calls(), vec![("gpu".to_string(), 2)]);
    assert_eq!(count(&registry, InstanceStatus::Allocated), 1);
    assert_eq!(count(&registry, InstanceStatus::AllocationFailed), 1);
    assert!(provider.terminate_calls().is_empty());
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_record_changed_before_request() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::default());

    let instances = claimed(&worker, &registry, "small", 1);
    let current = registry.get_instance(&instances[0].id).unwrap();
    assert!(registry.upsert_instance(&current, Some(current.version)).is_applied());

    let summary = worker
        .launch_new_instances_by_type("small", instances)
        .await
        .unwrap();

    assert_eq!(summary.requested, 0);
    assert_eq!(summary.created, 0);
    assert!(summary.terminated.is_empty());
    assert!(provider.create_calls().is_empty());
    assert!(provider.terminate_calls().is_empty());
}

#[tokio::test]
async fn test_lost_allocation_write_returns_resource_to_pool() {
    let registry = new_registry();
    let hook_registry = registry.clone();
    let target = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_target = target.clone();

    // Bump the record that gets paired first (the last one, pairing pops from the back).
    let provider = Arc::new(ScriptedProvider::new(move |_, n| {
        let ids: Vec<_> = hook_target.lock().unwrap().clone();
        let first_paired = *ids.last().expect("targets set before launch");
        let record: Instance = hook_registry.get_instance(&first_paired).unwrap();
        assert!(hook_registry.upsert_instance(&record, Some(record.version)).is_applied());
        Ok(cloud_instances(n))
    }));
    let worker = LaunchWorker::new(registry.clone(), provider.clone(), LauncherConfig::default());

    let instances = claimed(&worker, &registry, "small", 2);
    *target.lock().unwrap() = instances.iter().map(|i| i.id).collect();

    let summary = worker
        .launch_new_instances_by_type("small", instances.clone())
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.allocated, vec![instances[0].id]);
    assert_eq!(summary.abandoned, vec![instances[1].id]);
    assert!(summary.failed.is_empty());
    assert_eq!(provider.terminated_ids().len(), 1);
    assert_eq!(count(&registry, InstanceStatus::Allocated), 1);
    assert_eq!(count(&registry, InstanceStatus::AllocationFailed), 0);
}

#[tokio::test]
async fn test_zero_batch_size_is_clamped() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let worker = LaunchWorker::new(registry.clone(), provider, LauncherConfig::new(2, 0));

    let instances = claimed(&worker, &registry, "small", 3);
    let chunks = worker.plan_chunks(instances);
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|(_, chunk)| chunk.len() == 1));
}

#[tokio::test]
async fn test_zero_request_concurrency_still_launches() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::new(0, 5));
    assert_eq!(launcher.config().max_concurrent_requests(), 1);

    registry.request_instances("small", 2);
    tokio::time::timeout(Duration::from_secs(5), launcher.flush())
        .await
        .expect("flush finished")
        .unwrap();

    assert_eq!(count(&registry, InstanceStatus::Allocated), 2);
    launcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_launcher_releases_registry() {
    let registry = new_registry();
    let provider = Arc::new(MockProvider::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), LauncherConfig::default());
    registry.request_instances("small", 1);
    launcher.flush().await.unwrap();

    let weak = Arc::downgrade(&launcher);
    drop(launcher);
    assert!(weak.upgrade().is_none());

    // The detector exits once its command channel closes, releasing its registry handle.
    tokio::time::timeout(Duration::from_secs(5), async {
        while Arc::strong_count(&registry) > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("detector released the registry");

    // Later requests are ignored rather than failing the writer.
    registry.request_instances("small", 1);
    assert_eq!(count(&registry, InstanceStatus::Unknown), 1);
    assert_eq!(provider.create_calls().len(), 1);
}
