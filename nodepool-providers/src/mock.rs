use crate::{inventory::CloudInstance, NodeProvider};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockNodeStatus {
    Running,
    Terminated,
}

#[derive(Debug, Clone)]
struct MockNode {
    cloud_instance_id: String,
    instance_type: String,
    status: MockNodeStatus,
    internal_ip: String,
    external_ip: String,
}

#[derive(Default)]
struct MockState {
    serial: u32,
    nodes: HashMap<String, MockNode>,
    // Max live (non-terminated) nodes per type; absent = unlimited.
    quotas: HashMap<String, usize>,
    default_quota: Option<usize>,
    failing_types: HashSet<String>,
    fail_terminate: bool,
    create_calls: Vec<(String, usize)>,
    terminate_calls: Vec<Vec<String>>,
}

/// In-memory provider emulating a cloud API with per-type quotas.
///
/// Used by the orchestrator binary when `PROVIDER=mock` and by the test suites. It keeps a
/// journal of every call so tests can check what was created and released.
pub struct MockProvider {
    provider_code: &'static str,
    state: Mutex<MockState>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            provider_code: "mock",
            state: Mutex::new(MockState::default()),
            latency: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every `create_nodes` call (emulates slow provider APIs).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency).filter(|d| !d.is_zero());
        self
    }

    /// Cap live nodes of `instance_type`; requests beyond the cap are partially fulfilled.
    pub fn with_quota(self, instance_type: &str, max_live: usize) -> Self {
        self.lock().quotas.insert(instance_type.to_string(), max_live);
        self
    }

    /// Cap live nodes of every type without an explicit quota.
    pub fn with_default_quota(self, max_live: usize) -> Self {
        self.lock().default_quota = Some(max_live);
        self
    }

    /// Make every `create_nodes` call for `instance_type` fail.
    pub fn fail_creates_for(&self, instance_type: &str) {
        self.lock().failing_types.insert(instance_type.to_string());
    }

    pub fn fail_terminates(&self, fail: bool) {
        self.lock().fail_terminate = fail;
    }

    /// `(instance_type, count)` for every `create_nodes` call, in call order.
    pub fn create_calls(&self) -> Vec<(String, usize)> {
        self.lock().create_calls.clone()
    }

    /// Id lists passed to `terminate_nodes`, in call order.
    pub fn terminate_calls(&self) -> Vec<Vec<String>> {
        self.lock().terminate_calls.clone()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.lock().terminate_calls.iter().flatten().cloned().collect()
    }

    pub fn created_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn running_count(&self, instance_type: &str) -> usize {
        self.lock().live_count(instance_type)
    }

    /// Highest number of `create_nodes` calls observed running at the same time.
    pub fn max_concurrent_creates(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock cannot leave the journal half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MockState {
    fn live_count(&self, instance_type: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.instance_type == instance_type && n.status == MockNodeStatus::Running)
            .count()
    }

    fn capacity_left(&self, instance_type: &str) -> Option<usize> {
        let quota = self
            .quotas
            .get(instance_type)
            .copied()
            .or(self.default_quota)?;
        Some(quota.saturating_sub(self.live_count(instance_type)))
    }

    fn next_node(&mut self, instance_type: &str) -> MockNode {
        self.serial += 1;
        let n = self.serial;
        MockNode {
            cloud_instance_id: format!("mock-{}", uuid::Uuid::new_v4().simple()),
            instance_type: instance_type.to_string(),
            status: MockNodeStatus::Running,
            internal_ip: format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff),
            external_ip: format!("198.51.100.{}", n % 254 + 1),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeProvider for MockProvider {
    fn name(&self) -> &str {
        self.provider_code
    }

    async fn create_nodes(&self, instance_type: &str, count: usize) -> Result<Vec<CloudInstance>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.create_calls.push((instance_type.to_string(), count));

        if state.failing_types.contains(instance_type) {
            return Err(anyhow::anyhow!(
                "MockProvider: create_nodes failed for instance_type '{}'",
                instance_type
            ));
        }

        let granted = match state.capacity_left(instance_type) {
            Some(left) => count.min(left),
            None => count,
        };
        if granted < count {
            tracing::debug!(
                instance_type,
                requested = count,
                granted,
                "mock quota reached, partially fulfilling request"
            );
        }

        let mut created = Vec::with_capacity(granted);
        for _ in 0..granted {
            let node = state.next_node(instance_type);
            created.push(
                CloudInstance::new(node.cloud_instance_id.clone())
                    .with_ips(Some(node.internal_ip.clone()), Some(node.external_ip.clone())),
            );
            state.nodes.insert(node.cloud_instance_id.clone(), node);
        }
        Ok(created)
    }

    async fn terminate_nodes(&self, cloud_instance_ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        state.terminate_calls.push(cloud_instance_ids.to_vec());

        if state.fail_terminate {
            return Err(anyhow::anyhow!(
                "MockProvider: terminate_nodes failed for {} node(s)",
                cloud_instance_ids.len()
            ));
        }

        for id in cloud_instance_ids {
            match state.nodes.get_mut(id) {
                Some(node) => node.status = MockNodeStatus::Terminated,
                None => tracing::debug!(cloud_instance_id = %id, "mock terminate for unknown node"),
            }
        }
        Ok(())
    }
}
