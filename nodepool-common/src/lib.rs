use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod bus;

pub use bus::InstanceUpdateEvent;

// --- Identifiers ---

/// Registry-assigned identifier of a logical node. Stable for the life of the record.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for InstanceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Unknown,          // Requested by policy, not yet claimed
    Queued,           // Claimed by a launcher pass
    Requested,        // Selected for a provider call
    Allocated,        // Linked to a cloud instance
    AllocationFailed, // Provider could not back this record
    Terminating,      // Downstream asked the provider to release it
    Terminated,       // Gone on the provider side
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 7] = [
        InstanceStatus::Unknown,
        InstanceStatus::Queued,
        InstanceStatus::Requested,
        InstanceStatus::Allocated,
        InstanceStatus::AllocationFailed,
        InstanceStatus::Terminating,
        InstanceStatus::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Unknown => "unknown",
            InstanceStatus::Queued => "queued",
            InstanceStatus::Requested => "requested",
            InstanceStatus::Allocated => "allocated",
            InstanceStatus::AllocationFailed => "allocation_failed",
            InstanceStatus::Terminating => "terminating",
            InstanceStatus::Terminated => "terminated",
        }
    }

    /// Case-insensitive parse of the `as_str` form.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Edges of the instance state machine.
    ///
    /// The launcher drives `Unknown -> Queued -> Requested -> Allocated | AllocationFailed`.
    /// The remaining edges belong to downstream reconcilers (retry re-drive and termination).
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, to),
            (Unknown, Queued)
                | (Queued, Requested)
                | (Requested, Allocated)
                | (Requested, AllocationFailed)
                | (AllocationFailed, Unknown)
                | (Allocated, Terminating)
                | (Terminating, Terminated)
        )
    }

    /// Statuses after which the launcher never writes to the record again.
    pub fn is_launch_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Allocated
                | InstanceStatus::AllocationFailed
                | InstanceStatus::Terminating
                | InstanceStatus::Terminated
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime status of the node agent. Owned by downstream components; the launcher only
/// resets it to `Unknown` when a cloud instance is linked.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    #[default]
    Unknown,
    Installing,
    Running,
    Stopped,
}

// --- Errors ---

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid instance transition {from} -> {to}")]
pub struct TransitionError {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

// --- Entities ---

/// One logical cluster node, whether or not a cloud resource backs it yet.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub instance_type: String,
    pub status: InstanceStatus,
    pub runtime_status: RuntimeStatus,

    // Optimistic-concurrency token, assigned by the registry on commit.
    pub version: u64,

    // Populated once a cloud instance is linked (status >= allocated).
    pub cloud_instance_id: Option<String>,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// A fresh `Unknown` record, not yet stored.
    pub fn new(instance_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            instance_type: instance_type.into(),
            status: InstanceStatus::Unknown,
            runtime_status: RuntimeStatus::Unknown,
            version: 0,
            cloud_instance_id: None,
            internal_ip: None,
            external_ip: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to` if the state machine allows it. Only touches the local copy.
    pub fn transition_to(&mut self, to: InstanceStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.cloud_instance_id.is_some()
    }
}
