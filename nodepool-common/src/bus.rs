use serde::{Deserialize, Serialize};

use crate::{InstanceId, InstanceStatus};

// -----------------------------------------------------------------------------
// Registry change events
// -----------------------------------------------------------------------------

/// One committed change to an instance record.
///
/// `old_status` is `None` when the record was inserted; `new_status` is `None` when it was
/// deleted from the registry.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct InstanceUpdateEvent {
    pub instance_id: InstanceId,
    pub old_status: Option<InstanceStatus>,
    pub new_status: Option<InstanceStatus>,
}

impl InstanceUpdateEvent {
    pub fn new(
        instance_id: InstanceId,
        old_status: Option<InstanceStatus>,
        new_status: Option<InstanceStatus>,
    ) -> Self {
        Self {
            instance_id,
            old_status,
            new_status,
        }
    }

    /// The record now waits for a launcher to claim it.
    pub fn is_new_request(&self) -> bool {
        self.new_status == Some(InstanceStatus::Unknown)
    }
}
