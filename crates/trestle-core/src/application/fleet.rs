//! The worker fleet tracker: live worker instances and task-run leases.
//!
//! Membership change is detected epoch-style: a newly registered instance
//! claims a set of partitions, and any lease living on one of those
//! partitions under a different owner is considered lost. Lost leases are
//! deleted and their task runs redelivered with the failed attempt
//! preserved in history, so worker loss never surfaces as a user-visible
//! error.

use crate::domain::execution::Attempt;
use crate::domain::state::Status;
use crate::domain::worker::{WorkerInstance, WorkerTask, WorkerTaskRunning};
use crate::error::CoreError;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A fleet-membership or lease event
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// A worker instance joined (or re-announced itself after a rebalance)
    InstanceRegistered(WorkerInstance),

    /// A worker accepted a dispatched task
    LeaseCreated(WorkerTaskRunning),

    /// The reducer saw a terminal result for a leased task run
    LeaseReleased(String),
}

/// An effect of a fleet-tracker step
#[derive(Debug, Clone)]
pub enum FleetEffect {
    /// The lease record for the given task run is gone
    LeaseDeleted(String),

    /// A lost task run to feed back into the reducer for redispatch
    Redelivery(WorkerTask),
}

/// Tracks the live worker set and which instance owns which task run
pub struct FleetTracker {
    instances: Mutex<HashMap<Uuid, WorkerInstance>>,
    leases: Mutex<HashMap<String, WorkerTaskRunning>>,
}

impl FleetTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one fleet event, returning the effects to route
    pub fn handle(&self, event: FleetEvent) -> Result<Vec<FleetEffect>, CoreError> {
        match event {
            FleetEvent::InstanceRegistered(instance) => self.on_instance(instance),
            FleetEvent::LeaseCreated(lease) => {
                debug!(
                    task_run_id = %lease.task_run_id(),
                    worker_uuid = %lease.worker_instance.worker_uuid,
                    partition = lease.partition,
                    "Lease created"
                );
                self.lock_leases()?
                    .insert(lease.task_run_id().to_string(), lease);
                Ok(Vec::new())
            }
            FleetEvent::LeaseReleased(task_run_id) => {
                let removed = self.lock_leases()?.remove(&task_run_id).is_some();
                if removed {
                    debug!(task_run_id = %task_run_id, "Lease released");
                    Ok(vec![FleetEffect::LeaseDeleted(task_run_id)])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Number of currently live instances
    pub fn instance_count(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    /// Whether a lease exists for the given task run
    pub fn has_lease(&self, task_run_id: &str) -> bool {
        self.leases
            .lock()
            .map(|l| l.contains_key(task_run_id))
            .unwrap_or(false)
    }

    fn on_instance(&self, instance: WorkerInstance) -> Result<Vec<FleetEffect>, CoreError> {
        info!(
            worker_uuid = %instance.worker_uuid,
            hostname = %instance.hostname,
            partitions = ?instance.partitions,
            "Worker instance registered"
        );

        {
            let mut instances = self.lock_instances()?;
            // the new instance's partition claims supersede older owners
            for existing in instances.values_mut() {
                if existing.worker_uuid != instance.worker_uuid {
                    existing.partitions.retain(|p| !instance.partitions.contains(p));
                }
            }
            instances.retain(|_, i| !i.partitions.is_empty());
            instances.insert(instance.worker_uuid, instance.clone());
        }

        let lost: Vec<String> = {
            let leases = self.lock_leases()?;
            leases
                .values()
                .filter(|lease| {
                    lease.worker_instance.worker_uuid != instance.worker_uuid
                        && instance.partitions.contains(&lease.partition)
                })
                .map(|lease| lease.task_run_id().to_string())
                .collect()
        };

        let mut effects = Vec::new();
        for task_run_id in lost {
            let Some(lease) = self.lock_leases()?.remove(&task_run_id) else {
                continue;
            };

            warn!(
                task_run_id = %task_run_id,
                lost_worker = %lease.worker_instance.worker_uuid,
                new_worker = %instance.worker_uuid,
                "Lease owner superseded, requesting redelivery"
            );

            effects.push(FleetEffect::LeaseDeleted(task_run_id));
            effects.push(FleetEffect::Redelivery(redelivery_of(lease)));
        }

        Ok(effects)
    }

    fn lock_instances(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, WorkerInstance>>, CoreError> {
        self.instances
            .lock()
            .map_err(|e| CoreError::Other(format!("Instance table lock poisoned: {}", e)))
    }

    fn lock_leases(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, WorkerTaskRunning>>, CoreError> {
        self.leases
            .lock()
            .map_err(|e| CoreError::Other(format!("Lease table lock poisoned: {}", e)))
    }
}

impl Default for FleetTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the redelivery envelope for a lost lease: the prior attempt is
/// recorded as forced KILLED and the task run resets to CREATED so the
/// reducer dispatches it again.
fn redelivery_of(lease: WorkerTaskRunning) -> WorkerTask {
    let mut task_run = lease.worker_task.task_run.clone();

    task_run.attempts.push(Attempt {
        state: task_run.state.transition(Status::Killed),
    });
    task_run.state = task_run.state.transition(Status::Created);

    WorkerTask {
        task_run,
        ..lease.worker_task
    }
}
