//! In-memory instance registry.
//!
//! Single source of truth for instance records. Every write is a compare-and-set on the
//! record version (or on the table-wide storage version for batch writes); there are no
//! locks visible to callers. Subscribers are notified after each committed write.

use chrono::Utc;
use nodepool_common::{Instance, InstanceId, InstanceStatus, InstanceUpdateEvent};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};

/// Receives committed registry changes.
///
/// Called synchronously on the writer's thread after the commit, so implementations must
/// hand heavy work off elsewhere. A returned error (or a panic) is logged and does not
/// affect the write or the other subscribers.
pub trait InstanceUpdatedSubscriber: Send + Sync {
    fn notify(&self, events: &[InstanceUpdateEvent]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of a single-record compare-and-set.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    /// The write was committed under `version`.
    Applied { version: u64 },
    /// The stored version did not match; nothing was written.
    Conflict { current_version: Option<u64> },
}

impl UpsertResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpsertResult::Applied { .. })
    }

    /// New version on success, currently stored version (if any) on conflict.
    pub fn version(&self) -> Option<u64> {
        match self {
            UpsertResult::Applied { version } => Some(*version),
            UpsertResult::Conflict { current_version } => *current_version,
        }
    }
}

/// Outcome of a batch write guarded by the storage version.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub applied: bool,
    pub storage_version: u64,
}

#[derive(Default)]
struct Table {
    instances: HashMap<InstanceId, Instance>,
    // Bumped once per committed write call; also used as the version of written records.
    storage_version: u64,
}

impl Table {
    fn commit(&mut self, instances: impl IntoIterator<Item = Instance>) -> Vec<InstanceUpdateEvent> {
        self.storage_version += 1;
        let version = self.storage_version;
        let now = Utc::now();

        let mut events = Vec::new();
        for mut instance in instances {
            let previous = self.instances.get(&instance.id);
            let old_status = previous.map(|p| p.status);
            if let Some(previous) = previous {
                instance.created_at = previous.created_at;
            }
            instance.version = version;
            instance.updated_at = now;
            events.push(InstanceUpdateEvent::new(
                instance.id,
                old_status,
                Some(instance.status),
            ));
            self.instances.insert(instance.id, instance);
        }
        events
    }
}

#[derive(Default)]
pub struct InstanceRegistry {
    table: RwLock<Table>,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn InstanceUpdatedSubscriber>)>>,
    next_subscription: AtomicU64,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Subscriptions ---

    pub fn subscribe(&self, subscriber: Arc<dyn InstanceUpdatedSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        write_lock(&self.subscribers).push((id, subscriber));
        id
    }

    /// Returns false if the subscription was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = write_lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    // --- Reads ---

    /// Snapshot of records whose status is in `status_filter` (empty filter = all records).
    pub fn get_instances(&self, status_filter: &[InstanceStatus]) -> HashMap<InstanceId, Instance> {
        read_lock(&self.table)
            .instances
            .values()
            .filter(|i| status_filter.is_empty() || status_filter.contains(&i.status))
            .map(|i| (i.id, i.clone()))
            .collect()
    }

    /// Snapshot of the listed records that exist.
    pub fn get_instances_by_id(&self, ids: &[InstanceId]) -> HashMap<InstanceId, Instance> {
        let table = read_lock(&self.table);
        ids.iter()
            .filter_map(|id| table.instances.get(id))
            .map(|i| (i.id, i.clone()))
            .collect()
    }

    pub fn get_instance(&self, id: &InstanceId) -> Option<Instance> {
        read_lock(&self.table).instances.get(id).cloned()
    }

    pub fn storage_version(&self) -> u64 {
        read_lock(&self.table).storage_version
    }

    pub fn len(&self) -> usize {
        read_lock(&self.table).instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Writes ---

    /// Compare-and-set write of one record.
    ///
    /// `expected_version = None` inserts and only succeeds if the record does not exist;
    /// `Some(v)` only succeeds if the record exists with version `v`. The stored copy gets a
    /// fresh version; the caller's copy is not modified.
    pub fn upsert_instance(&self, instance: &Instance, expected_version: Option<u64>) -> UpsertResult {
        let (version, events) = {
            let mut table = write_lock(&self.table);
            let current_version = table.instances.get(&instance.id).map(|i| i.version);
            if current_version != expected_version {
                debug!(
                    instance_id = %instance.id,
                    expected = ?expected_version,
                    current = ?current_version,
                    "instance version mismatch"
                );
                return UpsertResult::Conflict { current_version };
            }
            let events = table.commit([instance.clone()]);
            (table.storage_version, events)
        };

        self.notify_subscribers(&events);
        UpsertResult::Applied { version }
    }

    /// All-or-nothing write of several records, guarded by the storage version
    /// (`None` = unconditional). Subscribers get one notification for the whole batch.
    pub fn batch_upsert_instances(
        &self,
        instances: &[Instance],
        expected_storage_version: Option<u64>,
    ) -> BatchResult {
        let (storage_version, events) = {
            let mut table = write_lock(&self.table);
            if let Some(expected) = expected_storage_version {
                if expected != table.storage_version {
                    return BatchResult {
                        applied: false,
                        storage_version: table.storage_version,
                    };
                }
            }
            if instances.is_empty() {
                return BatchResult {
                    applied: true,
                    storage_version: table.storage_version,
                };
            }
            let events = table.commit(instances.iter().cloned());
            (table.storage_version, events)
        };

        self.notify_subscribers(&events);
        BatchResult {
            applied: true,
            storage_version,
        }
    }

    /// Create `count` new `Unknown` records of `instance_type` in one committed batch.
    ///
    /// Entry point for the scaling policy; returns the stored copies.
    pub fn request_instances(&self, instance_type: &str, count: usize) -> Vec<Instance> {
        if count == 0 {
            return Vec::new();
        }
        let fresh: Vec<Instance> = (0..count).map(|_| Instance::new(instance_type)).collect();
        let ids: Vec<InstanceId> = fresh.iter().map(|i| i.id).collect();

        let events = write_lock(&self.table).commit(fresh);
        self.notify_subscribers(&events);

        let stored = self.get_instances_by_id(&ids);
        ids.iter().filter_map(|id| stored.get(id).cloned()).collect()
    }

    /// Remove records (once terminated and acknowledged downstream), guarded by the storage
    /// version. Emits events with `new_status = None`.
    pub fn batch_delete_instances(
        &self,
        ids: &[InstanceId],
        expected_storage_version: Option<u64>,
    ) -> BatchResult {
        let (storage_version, events) = {
            let mut table = write_lock(&self.table);
            if let Some(expected) = expected_storage_version {
                if expected != table.storage_version {
                    return BatchResult {
                        applied: false,
                        storage_version: table.storage_version,
                    };
                }
            }
            let events: Vec<InstanceUpdateEvent> = ids
                .iter()
                .filter_map(|id| table.instances.remove(id))
                .map(|removed| InstanceUpdateEvent::new(removed.id, Some(removed.status), None))
                .collect();
            if !events.is_empty() {
                table.storage_version += 1;
            }
            (table.storage_version, events)
        };

        if !events.is_empty() {
            self.notify_subscribers(&events);
        }
        BatchResult {
            applied: true,
            storage_version,
        }
    }

    fn notify_subscribers(&self, events: &[InstanceUpdateEvent]) {
        let subscribers: Vec<_> = read_lock(&self.subscribers)
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();

        for (id, subscriber) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.notify(events))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(subscription = id.0, error = %e, "subscriber failed to handle update"),
                Err(_) => error!(subscription = id.0, "subscriber panicked while handling update"),
            }
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
