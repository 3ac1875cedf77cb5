use crate::domain::state::{State, Status};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One run of a flow revision.
///
/// The task-run tree is kept as a flat, insertion-ordered sequence with
/// parent back-references rather than nested owning nodes; every tree query
/// (children-of, root set, terminal check) scans this sequence. An
/// execution is owned exclusively by the reducer and is only ever replaced
/// as a whole snapshot, never edited in place across threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique execution identifier
    pub id: String,

    /// Namespace of the flow this execution runs
    pub namespace: String,

    /// Id of the flow this execution runs
    pub flow_id: String,

    /// Exact flow revision this execution resolves against
    pub flow_revision: u32,

    /// Task runs in creation order; indexes are stable for the lifetime of
    /// the execution
    #[serde(default)]
    pub task_runs: Vec<TaskRun>,

    /// Current state with full transition history
    pub state: State,
}

impl Execution {
    /// Create a new execution in `CREATED` for the given flow identity
    pub fn new(namespace: &str, flow_id: &str, flow_revision: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            flow_id: flow_id.to_string(),
            flow_revision,
            task_runs: Vec::new(),
            state: State::new(),
        }
    }

    /// Find a task run by id
    pub fn find_task_run(&self, task_run_id: &str) -> Option<&TaskRun> {
        self.task_runs.iter().find(|tr| tr.id == task_run_id)
    }

    /// Find a task run by id, mutably
    pub fn find_task_run_mut(&mut self, task_run_id: &str) -> Option<&mut TaskRun> {
        self.task_runs.iter_mut().find(|tr| tr.id == task_run_id)
    }

    /// Direct children of the given task run, in creation order
    pub fn children_of(&self, parent_task_run_id: &str) -> Vec<&TaskRun> {
        self.task_runs
            .iter()
            .filter(|tr| tr.parent_task_run_id.as_deref() == Some(parent_task_run_id))
            .collect()
    }

    /// Task runs without a parent, in creation order
    pub fn root_task_runs(&self) -> Vec<&TaskRun> {
        self.task_runs
            .iter()
            .filter(|tr| tr.parent_task_run_id.is_none())
            .collect()
    }

    /// Whether every task run has reached a terminal state
    pub fn all_task_runs_terminal(&self) -> bool {
        self.task_runs.iter().all(|tr| tr.state.is_terminal())
    }

    /// How many task runs currently sit in the given status
    pub fn count_with_status(&self, status: Status) -> usize {
        self.task_runs
            .iter()
            .filter(|tr| tr.state.current() == status)
            .count()
    }
}

/// One instantiation of a task within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Unique task-run identifier
    pub id: String,

    /// Execution this run belongs to
    pub execution_id: String,

    /// Task this run instantiates
    pub task_id: String,

    /// Back-reference to the composite parent's task run, if any
    pub parent_task_run_id: Option<String>,

    /// Iteration value for ForEach children
    pub value: Option<String>,

    /// Current state with full transition history
    pub state: State,

    /// One record per dispatch or redelivery, each carrying the terminal
    /// outcome of that attempt
    #[serde(default)]
    pub attempts: Vec<Attempt>,
}

impl TaskRun {
    /// Create a new task run in `CREATED`
    pub fn new(
        execution_id: &str,
        task_id: &str,
        parent_task_run_id: Option<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            task_id: task_id.to_string(),
            parent_task_run_id,
            value,
            state: State::new(),
            attempts: Vec::new(),
        }
    }
}

/// One dispatch or redelivery record for a task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Outcome of this attempt
    pub state: State,
}

/// Request to cancel an execution, keyed by execution id.
///
/// Idempotent: deliveries for an execution already killing or terminal are
/// no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionKilled {
    /// Id of the execution to cancel
    pub execution_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_execution() {
        let execution = Execution::new("unit.test", "flow", 3);

        assert!(!execution.id.is_empty());
        assert_eq!(execution.namespace, "unit.test");
        assert_eq!(execution.flow_id, "flow");
        assert_eq!(execution.flow_revision, 3);
        assert_eq!(execution.state.current(), Status::Created);
        assert!(execution.task_runs.is_empty());
        assert!(execution.all_task_runs_terminal());
    }

    #[test]
    fn test_tree_queries_over_flat_arena() {
        let mut execution = Execution::new("unit.test", "flow", 1);

        let parent = TaskRun::new(&execution.id, "parent", None, None);
        let parent_id = parent.id.clone();
        let child_a = TaskRun::new(&execution.id, "a", Some(parent_id.clone()), None);
        let child_b = TaskRun::new(&execution.id, "b", Some(parent_id.clone()), None);

        execution.task_runs.push(parent);
        execution.task_runs.push(child_a);
        execution.task_runs.push(child_b);

        let roots = execution.root_task_runs();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].task_id, "parent");

        let children = execution.children_of(&parent_id);
        let ids: Vec<&str> = children.iter().map(|c| c.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_all_task_runs_terminal() {
        let mut execution = Execution::new("unit.test", "flow", 1);

        let mut run = TaskRun::new(&execution.id, "a", None, None);
        run.state = run.state.transition(Status::Running);
        execution.task_runs.push(run);

        assert!(!execution.all_task_runs_terminal());

        let run_id = execution.task_runs[0].id.clone();
        let run = execution.find_task_run_mut(&run_id).unwrap();
        run.state = run.state.transition(Status::Success);

        assert!(execution.all_task_runs_terminal());
        assert_eq!(execution.count_with_status(Status::Success), 1);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut execution = Execution::new("unit.test", "flow", 1);
        execution
            .task_runs
            .push(TaskRun::new(&execution.id, "a", None, Some("x".to_string())));

        let serialized = serde_json::to_string(&execution).unwrap();
        let deserialized: Execution = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized, execution);
    }
}
