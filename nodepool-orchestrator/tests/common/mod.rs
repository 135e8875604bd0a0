// Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use nodepool_common::{Instance, InstanceStatus};
use nodepool_orchestrator::instance_registry::InstanceRegistry;
use nodepool_providers::inventory::CloudInstance;
use nodepool_providers::NodeProvider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type CreateHook = dyn Fn(&str, usize) -> anyhow::Result<Vec<CloudInstance>> + Send + Sync;

/// Provider whose `create_nodes` answer is computed by a closure.
///
/// Lets tests return more nodes than asked, fail outright, or mutate the registry while the
/// request is "in flight".
pub struct ScriptedProvider {
    on_create: Box<CreateHook>,
    fail_terminate: bool,
    create_calls: Mutex<Vec<(String, usize)>>,
    terminate_calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new(
        on_create: impl Fn(&str, usize) -> anyhow::Result<Vec<CloudInstance>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_create: Box::new(on_create),
            fail_terminate: false,
            create_calls: Mutex::new(Vec::new()),
            terminate_calls: Mutex::new(Vec::new()),
        }
    }

    /// Always return exactly `n` nodes, whatever was asked.
    pub fn returning(n: usize) -> Self {
        Self::new(move |_, _| Ok(cloud_instances(n)))
    }

    pub fn failing_terminates(mut self) -> Self {
        self.fail_terminate = true;
        self
    }

    pub fn create_calls(&self) -> Vec<(String, usize)> {
        self.create_calls.lock().unwrap().clone()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.terminate_calls
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl NodeProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_nodes(
        &self,
        instance_type: &str,
        count: usize,
    ) -> anyhow::Result<Vec<CloudInstance>> {
        self.create_calls
            .lock()
            .unwrap()
            .push((instance_type.to_string(), count));
        (self.on_create)(instance_type, count)
    }

    async fn terminate_nodes(&self, cloud_instance_ids: &[String]) -> anyhow::Result<()> {
        self.terminate_calls
            .lock()
            .unwrap()
            .push(cloud_instance_ids.to_vec());
        if self.fail_terminate {
            anyhow::bail!("scripted terminate failure");
        }
        Ok(())
    }
}

/// `n` cloud instances with distinct ids and addresses.
pub fn cloud_instances(n: usize) -> Vec<CloudInstance> {
    (0..n)
        .map(|i| {
            CloudInstance::new(format!("cloud-{}", uuid::Uuid::new_v4().simple()))
                .with_ips(Some(format!("10.1.0.{}", i + 1)), None)
        })
        .collect()
}

pub fn new_registry() -> Arc<InstanceRegistry> {
    Arc::new(InstanceRegistry::new())
}

pub fn count_by_status(registry: &InstanceRegistry) -> HashMap<InstanceStatus, usize> {
    let mut counts = HashMap::new();
    for instance in registry.get_instances(&[]).values() {
        *counts.entry(instance.status).or_insert(0) += 1;
    }
    counts
}

pub fn count(registry: &InstanceRegistry, status: InstanceStatus) -> usize {
    registry.get_instances(&[status]).len()
}

/// Cloud instance ids linked to registry records.
pub fn linked_cloud_ids(registry: &InstanceRegistry) -> Vec<String> {
    registry
        .get_instances(&[])
        .into_values()
        .filter_map(|i: Instance| i.cloud_instance_id)
        .collect()
}
