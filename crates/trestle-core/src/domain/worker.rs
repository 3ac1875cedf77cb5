use crate::domain::execution::TaskRun;
use crate::domain::flow::Task;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identity of a worker process in the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    /// Stable identity of the worker process
    pub worker_uuid: Uuid,

    /// Host the worker runs on
    pub hostname: String,

    /// Partition indexes this instance currently claims
    pub partitions: Vec<i32>,
}

impl WorkerInstance {
    /// Create a worker instance with a fresh uuid
    pub fn new(hostname: &str, partitions: Vec<i32>) -> Self {
        Self {
            worker_uuid: Uuid::new_v4(),
            hostname: hostname.to_string(),
            partitions,
        }
    }
}

/// Variables handed to a worker alongside a task
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunContext {
    /// Free-form key/value variables
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

/// Dispatch envelope: a unit of work sent to the worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    /// The task run being executed
    pub task_run: TaskRun,

    /// Definition of the task to execute
    pub task: Task,

    /// Execution context for the worker
    pub run_context: RunContext,

    /// Set when the envelope is a worker-pinned group: the subflow task-run
    /// id the children belong to
    pub worker_group: Option<String>,
}

/// A worker's report of a task run's new state.
///
/// May arrive after the execution has moved on; the reducer absorbs it only
/// while the task run is not yet terminal and ignores it otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTaskResult {
    /// The task run as reported by the worker
    pub task_run: TaskRun,
}

impl WorkerTaskResult {
    /// Build a result for the given task run
    pub fn new(task_run: TaskRun) -> Self {
        Self { task_run }
    }
}

/// Lease record: which worker instance currently owns a running task run.
///
/// Created when a worker accepts a dispatch, deleted on terminal result or
/// when the fleet tracker detects the owner lost its partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTaskRunning {
    /// The dispatched envelope, kept whole so a lost lease can be redelivered
    pub worker_task: WorkerTask,

    /// The instance executing the task
    pub worker_instance: WorkerInstance,

    /// Partition index the lease lives on
    pub partition: i32,
}

impl WorkerTaskRunning {
    /// Build a lease for a dispatched task accepted by an instance
    pub fn of(worker_task: WorkerTask, worker_instance: WorkerInstance, partition: i32) -> Self {
        Self {
            worker_task,
            worker_instance,
            partition,
        }
    }

    /// Id of the leased task run, the lease's key
    pub fn task_run_id(&self) -> &str {
        &self.worker_task.task_run.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::TaskKind;

    #[test]
    fn test_worker_instance_identity() {
        let first = WorkerInstance::new("unit-test", vec![0, 1]);
        let second = WorkerInstance::new("unit-test", vec![0, 1]);

        assert_ne!(first.worker_uuid, second.worker_uuid);
        assert_eq!(first.partitions, vec![0, 1]);
    }

    #[test]
    fn test_lease_key_is_task_run_id() {
        let task_run = TaskRun::new("exec", "a", None, None);
        let task_run_id = task_run.id.clone();
        let worker_task = WorkerTask {
            task_run,
            task: Task {
                id: "a".to_string(),
                kind: TaskKind::Runnable {
                    task_type: "log".to_string(),
                    config: serde_json::Value::Null,
                },
            },
            run_context: RunContext::default(),
            worker_group: None,
        };

        let lease = WorkerTaskRunning::of(worker_task, WorkerInstance::new("unit-test", vec![0]), 0);
        assert_eq!(lease.task_run_id(), task_run_id);
    }
}
