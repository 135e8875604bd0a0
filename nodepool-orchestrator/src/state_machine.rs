use nodepool_common::{Instance, InstanceStatus, RuntimeStatus, TransitionError};
use nodepool_providers::inventory::CloudInstance;
use tracing::{debug, info};

use crate::instance_registry::{InstanceRegistry, UpsertResult};

/// Record a committed state transition.
fn log_state_transition(instance: &Instance, from_status: InstanceStatus, reason: &str) {
    info!(
        instance_id = %instance.id,
        instance_type = %instance.instance_type,
        from = %from_status,
        to = %instance.status,
        version = instance.version,
        reason,
        "instance state transition"
    );
}

/// Compare-and-set `instance` into `to`, guarded by the version the caller last observed.
///
/// Returns Ok(true) when committed; `instance` then mirrors the stored record (new status,
/// new version, patched fields). Returns Ok(false) when another writer got there first; the
/// caller's copy is left untouched.
fn apply_transition(
    registry: &InstanceRegistry,
    instance: &mut Instance,
    to: InstanceStatus,
    reason: &str,
    patch: impl FnOnce(&mut Instance),
) -> Result<bool, TransitionError> {
    let from_status = instance.status;
    let mut candidate = instance.clone();
    candidate.transition_to(to)?;
    patch(&mut candidate);

    match registry.upsert_instance(&candidate, Some(instance.version)) {
        UpsertResult::Applied { version } => {
            candidate.version = version;
            *instance = candidate;
            log_state_transition(instance, from_status, reason);
            Ok(true)
        }
        UpsertResult::Conflict { current_version } => {
            debug!(
                instance_id = %instance.id,
                from = %from_status,
                to = %to,
                expected_version = instance.version,
                current_version = ?current_version,
                "transition lost compare-and-set"
            );
            Ok(false)
        }
    }
}

/// Transition UNKNOWN -> QUEUED (claim by a reconciliation pass).
pub fn unknown_to_queued(
    registry: &InstanceRegistry,
    instance: &mut Instance,
) -> Result<bool, TransitionError> {
    apply_transition(registry, instance, InstanceStatus::Queued, "claimed", |_| {})
}

/// Transition QUEUED -> REQUESTED (selected for a provider call).
pub fn queued_to_requested(
    registry: &InstanceRegistry,
    instance: &mut Instance,
) -> Result<bool, TransitionError> {
    apply_transition(
        registry,
        instance,
        InstanceStatus::Requested,
        "selected_for_launch",
        |_| {},
    )
}

/// Transition REQUESTED -> ALLOCATED, linking the cloud instance to the record.
pub fn requested_to_allocated(
    registry: &InstanceRegistry,
    instance: &mut Instance,
    cloud_instance: &CloudInstance,
) -> Result<bool, TransitionError> {
    apply_transition(
        registry,
        instance,
        InstanceStatus::Allocated,
        "provider_allocated",
        |candidate| {
            candidate.cloud_instance_id = Some(cloud_instance.cloud_instance_id.clone());
            candidate.internal_ip = cloud_instance.internal_ip.clone();
            candidate.external_ip = cloud_instance.external_ip.clone();
            candidate.runtime_status = RuntimeStatus::Unknown;
        },
    )
}

/// Transition REQUESTED -> ALLOCATION_FAILED (no cloud instance could be linked).
pub fn requested_to_allocation_failed(
    registry: &InstanceRegistry,
    instance: &mut Instance,
    reason: &str,
) -> Result<bool, TransitionError> {
    apply_transition(
        registry,
        instance,
        InstanceStatus::AllocationFailed,
        reason,
        |_| {},
    )
}
