//! Instance launcher: drives `Unknown` records to `Allocated` or `AllocationFailed`.
//!
//! Two tiers of scheduling:
//! - a single detector task runs reconciliation passes one at a time, so two passes can
//!   never claim the same `Unknown` record;
//! - each claimed chunk is launched in its own task, gated by a semaphore of
//!   `max_concurrent_requests` permits, so slow provider calls overlap without holding up
//!   the detector.
//!
//! Every registry write is a compare-and-set against the last version this component
//! observed. Losing a CAS means someone else changed the record (for instance cancelled it);
//! the record is then dropped from the current operation.

use nodepool_common::{Instance, InstanceId, InstanceStatus, InstanceUpdateEvent};
use nodepool_providers::inventory::CloudInstance;
use nodepool_providers::NodeProvider;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::LauncherConfig;
use crate::instance_registry::{InstanceRegistry, InstanceUpdatedSubscriber, SubscriptionId};
use crate::state_machine;

#[derive(Debug, Error)]
pub enum LaunchError {
    /// The provider call failed as a whole. The chunk's records stay `Requested`.
    #[error("provider failed to create {requested} node(s) of type {instance_type}")]
    Provider {
        instance_type: String,
        requested: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("launch worker pool is closed")]
    WorkerPoolClosed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("instance launcher is shut down")]
pub struct LauncherClosed;

/// What happened to one launch chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSummary {
    pub instance_type: String,
    /// Records that changed before they could be moved to `Requested`.
    pub dropped: Vec<InstanceId>,
    /// Nodes asked from the provider.
    pub requested: usize,
    /// Cloud instances the provider returned.
    pub created: usize,
    pub allocated: Vec<InstanceId>,
    pub failed: Vec<InstanceId>,
    /// Records whose final write lost to a concurrent writer; that writer's state stands.
    pub abandoned: Vec<InstanceId>,
    /// Cloud instance ids passed to `terminate_nodes`.
    pub terminated: Vec<String>,
    pub termination_failed: bool,
}

impl LaunchSummary {
    fn new(instance_type: &str) -> Self {
        Self {
            instance_type: instance_type.to_string(),
            ..Default::default()
        }
    }

    /// Created cloud instances that ended up either linked or handed to termination.
    pub fn accounted_cloud_instances(&self) -> usize {
        self.allocated.len() + self.terminated.len()
    }
}

/// Claim and launch logic, shared by the detector and the launch tasks.
pub struct LaunchWorker {
    registry: Arc<InstanceRegistry>,
    provider: Arc<dyn NodeProvider>,
    config: LauncherConfig,
    launch_permits: Arc<Semaphore>,
}

impl LaunchWorker {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        provider: Arc<dyn NodeProvider>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            launch_permits: Arc::new(Semaphore::new(config.max_concurrent_requests())),
            registry,
            provider,
            config,
        }
    }

    pub fn config(&self) -> LauncherConfig {
        self.config
    }

    /// Move every `Unknown` record to `Queued`. Only records whose CAS succeeded are
    /// returned; losers were mutated by someone else and are skipped for this pass.
    pub fn claim_new_instances(&self) -> Vec<Instance> {
        let new_instances = self.registry.get_instances(&[InstanceStatus::Unknown]);
        if new_instances.is_empty() {
            debug!("No instances to launch");
            return Vec::new();
        }

        let mut queued = Vec::with_capacity(new_instances.len());
        for mut instance in new_instances.into_values() {
            match state_machine::unknown_to_queued(&self.registry, &mut instance) {
                Ok(true) => queued.push(instance),
                Ok(false) => warn!(
                    instance_id = %instance.id,
                    "Failed to claim instance, it was modified concurrently"
                ),
                Err(e) => error!(instance_id = %instance.id, error = %e, "Failed to claim instance"),
            }
        }
        queued
    }

    /// Group claimed records by type and split each group into chunks of at most
    /// `max_nodes_per_request`.
    pub fn plan_chunks(&self, claimed: Vec<Instance>) -> Vec<(String, Vec<Instance>)> {
        let mut by_type: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        for instance in claimed {
            by_type
                .entry(instance.instance_type.clone())
                .or_default()
                .push(instance);
        }

        let mut chunks = Vec::new();
        for (instance_type, instances) in by_type {
            for chunk in instances.chunks(self.config.max_nodes_per_request()) {
                chunks.push((instance_type.clone(), chunk.to_vec()));
            }
        }
        chunks
    }

    /// One reconciliation pass: claim, chunk, and hand every chunk to the launch pool.
    /// Returns the number of chunks submitted.
    fn may_launch_new_instances(
        self: &Arc<Self>,
        launches: &mut JoinSet<Result<LaunchSummary, LaunchError>>,
    ) -> usize {
        let claimed = self.claim_new_instances();
        if claimed.is_empty() {
            return 0;
        }

        let chunks = self.plan_chunks(claimed);
        let submitted = chunks.len();
        for (instance_type, instances) in chunks {
            let worker = Arc::clone(self);
            launches.spawn(async move {
                let _permit = Arc::clone(&worker.launch_permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| LaunchError::WorkerPoolClosed)?;
                worker
                    .launch_new_instances_by_type(&instance_type, instances)
                    .await
            });
        }
        submitted
    }

    /// Launch one chunk of queued records of a single type.
    pub async fn launch_new_instances_by_type(
        &self,
        instance_type: &str,
        instances: Vec<Instance>,
    ) -> Result<LaunchSummary, LaunchError> {
        info!(instance_type, count = instances.len(), "Launching instances");
        let mut summary = LaunchSummary::new(instance_type);

        let mut pending = Vec::with_capacity(instances.len());
        for mut instance in instances {
            match state_machine::queued_to_requested(&self.registry, &mut instance) {
                Ok(true) => pending.push(instance),
                Ok(false) => {
                    warn!(
                        instance_id = %instance.id,
                        "Instance changed before launch, dropping it from the request"
                    );
                    summary.dropped.push(instance.id);
                }
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Instance is not launchable");
                    summary.dropped.push(instance.id);
                }
            }
        }

        if pending.is_empty() {
            return Ok(summary);
        }

        summary.requested = pending.len();
        let mut created = self
            .provider
            .create_nodes(instance_type, summary.requested)
            .await
            .map_err(|source| {
                error!(
                    instance_type,
                    requested = summary.requested,
                    provider = self.provider.name(),
                    error = %source,
                    "create_nodes failed, instances stay requested"
                );
                LaunchError::Provider {
                    instance_type: instance_type.to_string(),
                    requested: summary.requested,
                    source,
                }
            })?;
        summary.created = created.len();

        if created.len() > summary.requested {
            // Contract violation; the surplus is terminated below with the other leftovers.
            warn!(
                instance_type,
                requested = summary.requested,
                created = created.len(),
                provider = self.provider.name(),
                "provider returned more nodes than requested"
            );
        }

        self.link_cloud_instances(&mut pending, &mut created, &mut summary);

        if !created.is_empty() {
            self.terminate_leaked(created, &mut summary).await;
        }

        self.fail_unlinked(pending, &mut summary);

        Ok(summary)
    }

    /// Mark records that got no cloud instance as `AllocationFailed`.
    fn fail_unlinked(&self, pending: Vec<Instance>, summary: &mut LaunchSummary) {
        for mut instance in pending {
            match state_machine::requested_to_allocation_failed(
                &self.registry,
                &mut instance,
                "provider_under_allocated",
            ) {
                Ok(true) => summary.failed.push(instance.id),
                Ok(false) => {
                    warn!(
                        instance_id = %instance.id,
                        "Failed to mark instance allocation_failed, leaving it to a later pass"
                    );
                    summary.abandoned.push(instance.id);
                }
                Err(e) => {
                    error!(
                        instance_id = %instance.id,
                        error = %e,
                        "Cannot mark instance allocation_failed"
                    );
                    summary.abandoned.push(instance.id);
                }
            }
        }
    }

    /// Pair cloud instances with pending records one-to-one until either side runs out.
    /// A cloud instance whose write lost its CAS goes back to the unconsumed pool.
    fn link_cloud_instances(
        &self,
        pending: &mut Vec<Instance>,
        created: &mut Vec<CloudInstance>,
        summary: &mut LaunchSummary,
    ) {
        while !created.is_empty() {
            let Some(mut instance) = pending.pop() else {
                break;
            };
            let Some(cloud_instance) = created.pop() else {
                break;
            };

            match state_machine::requested_to_allocated(&self.registry, &mut instance, &cloud_instance)
            {
                Ok(true) => summary.allocated.push(instance.id),
                Ok(false) => {
                    warn!(
                        instance_id = %instance.id,
                        cloud_instance_id = %cloud_instance.cloud_instance_id,
                        "Failed to link cloud instance, the request was probably cancelled"
                    );
                    summary.abandoned.push(instance.id);
                    created.push(cloud_instance);
                }
                Err(e) => {
                    error!(
                        instance_id = %instance.id,
                        cloud_instance_id = %cloud_instance.cloud_instance_id,
                        error = %e,
                        "Cannot link cloud instance"
                    );
                    summary.abandoned.push(instance.id);
                    created.push(cloud_instance);
                }
            }
        }
    }

    async fn terminate_leaked(&self, leaked: Vec<CloudInstance>, summary: &mut LaunchSummary) {
        let ids: Vec<String> = leaked.into_iter().map(|c| c.cloud_instance_id).collect();
        info!(
            instance_type = %summary.instance_type,
            count = ids.len(),
            cloud_instance_ids = ?ids,
            "Terminating leaked cloud instances"
        );
        if let Err(e) = self.provider.terminate_nodes(&ids).await {
            error!(
                instance_type = %summary.instance_type,
                cloud_instance_ids = ?ids,
                provider = self.provider.name(),
                error = %e,
                "Failed to terminate leaked cloud instances"
            );
            summary.termination_failed = true;
        }
        summary.terminated = ids;
    }
}

enum LauncherCommand {
    Reconcile,
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Launches newly requested instances. Fed by a [`LaunchTrigger`] subscribed to the registry.
pub struct InstanceLauncher {
    worker: Arc<LaunchWorker>,
    commands: mpsc::UnboundedSender<LauncherCommand>,
    detector: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl InstanceLauncher {
    /// Spawn the detector, subscribe to `registry` and queue an initial pass for records
    /// requested before the launcher existed. Must be called inside a tokio runtime.
    ///
    /// The registry only keeps a weak handle to the launcher. Dropping the last `Arc`
    /// without calling [`shutdown`](Self::shutdown) closes the command channel; the detector
    /// then finishes in-flight launches and exits.
    pub fn start(
        registry: Arc<InstanceRegistry>,
        provider: Arc<dyn NodeProvider>,
        config: LauncherConfig,
    ) -> Arc<Self> {
        let worker = Arc::new(LaunchWorker::new(Arc::clone(&registry), provider, config));
        let (commands, receiver) = mpsc::unbounded_channel();
        let detector = tokio::spawn(run_detector(Arc::clone(&worker), receiver));

        let launcher = Arc::new(Self {
            worker,
            commands,
            detector: Mutex::new(Some(detector)),
            subscription: Mutex::new(None),
        });

        let subscription = registry.subscribe(Arc::new(LaunchTrigger(Arc::downgrade(&launcher))));
        *lock(&launcher.subscription) = Some(subscription);
        // Cannot fail: the detector was just spawned.
        let _ = launcher.request_reconcile();

        info!(
            max_concurrent_requests = config.max_concurrent_requests(),
            max_nodes_per_request = config.max_nodes_per_request(),
            "Instance launcher started"
        );
        launcher
    }

    pub fn config(&self) -> LauncherConfig {
        self.worker.config()
    }

    /// Queue a reconciliation pass. Triggers queued while a pass runs are merged.
    pub fn request_reconcile(&self) -> Result<(), LauncherClosed> {
        self.commands
            .send(LauncherCommand::Reconcile)
            .map_err(|_| LauncherClosed)
    }

    /// Wait until every pass queued so far has run and all launches in flight have finished.
    pub async fn flush(&self) -> Result<(), LauncherClosed> {
        let (done, wait) = oneshot::channel();
        self.commands
            .send(LauncherCommand::Flush(done))
            .map_err(|_| LauncherClosed)?;
        wait.await.map_err(|_| LauncherClosed)
    }

    /// Unsubscribe, finish queued work, and stop the detector.
    pub async fn shutdown(&self) -> Result<(), LauncherClosed> {
        if let Some(subscription) = lock(&self.subscription).take() {
            self.worker.registry.unsubscribe(subscription);
        }

        let (done, wait) = oneshot::channel();
        self.commands
            .send(LauncherCommand::Shutdown(done))
            .map_err(|_| LauncherClosed)?;
        wait.await.map_err(|_| LauncherClosed)?;

        let detector = lock(&self.detector).take();
        if let Some(detector) = detector {
            if let Err(e) = detector.await {
                error!(error = %e, "Launcher detector task failed");
            }
        }
        info!("Instance launcher stopped");
        Ok(())
    }
}

/// Registry subscription of an [`InstanceLauncher`]. Holds it weakly so the registry never
/// keeps a launcher (and through it the registry itself) alive.
struct LaunchTrigger(Weak<InstanceLauncher>);

impl InstanceUpdatedSubscriber for LaunchTrigger {
    fn notify(&self, events: &[InstanceUpdateEvent]) -> anyhow::Result<()> {
        // TODO: reconcile only the ids carried by the events instead of rescanning every
        // unknown record.
        if !events.iter().any(InstanceUpdateEvent::is_new_request) {
            return Ok(());
        }
        match self.0.upgrade() {
            Some(launcher) => Ok(launcher.request_reconcile()?),
            None => Ok(()),
        }
    }
}

async fn run_detector(
    worker: Arc<LaunchWorker>,
    mut commands: mpsc::UnboundedReceiver<LauncherCommand>,
) {
    let mut launches: JoinSet<Result<LaunchSummary, LaunchError>> = JoinSet::new();
    let mut deferred: Option<LauncherCommand> = None;

    loop {
        let command = match deferred.take() {
            Some(command) => Some(command),
            None => tokio::select! {
                command = commands.recv() => command,
                Some(joined) = launches.join_next(), if !launches.is_empty() => {
                    log_launch_result(joined);
                    continue;
                }
            },
        };

        match command {
            Some(LauncherCommand::Reconcile) => {
                // Any further queued trigger is covered by this pass.
                while let Ok(next) = commands.try_recv() {
                    if !matches!(next, LauncherCommand::Reconcile) {
                        deferred = Some(next);
                        break;
                    }
                }
                let submitted = worker.may_launch_new_instances(&mut launches);
                if submitted > 0 {
                    debug!(chunks = submitted, "Submitted launch chunks");
                }
            }
            Some(LauncherCommand::Flush(done)) => {
                drain_launches(&mut launches).await;
                let _ = done.send(());
            }
            Some(LauncherCommand::Shutdown(done)) => {
                drain_launches(&mut launches).await;
                let _ = done.send(());
                break;
            }
            None => {
                drain_launches(&mut launches).await;
                break;
            }
        }
    }
}

async fn drain_launches(launches: &mut JoinSet<Result<LaunchSummary, LaunchError>>) {
    while let Some(joined) = launches.join_next().await {
        log_launch_result(joined);
    }
}

fn log_launch_result(joined: Result<Result<LaunchSummary, LaunchError>, JoinError>) {
    match joined {
        Ok(Ok(summary)) => info!(
            instance_type = %summary.instance_type,
            requested = summary.requested,
            created = summary.created,
            allocated = summary.allocated.len(),
            failed = summary.failed.len(),
            dropped = summary.dropped.len(),
            abandoned = summary.abandoned.len(),
            terminated = summary.terminated.len(),
            "Launch finished"
        ),
        Ok(Err(e)) => error!(error = %e, "Launch failed"),
        Err(e) => error!(error = %e, "Launch task panicked"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
