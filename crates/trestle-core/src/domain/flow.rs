use crate::domain::execution::TaskRun;
use crate::domain::state::Status;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// A versioned workflow definition.
///
/// A flow is immutable once published: republishing under the same
/// (namespace, id) produces a new revision, never a mutation of an
/// existing one. Executions carry the exact revision they were started
/// against so the directory can resolve it for their whole lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Namespace the flow lives in
    pub namespace: String,

    /// Flow identifier, unique within its namespace
    pub id: String,

    /// Monotonic revision number, starting at 1
    pub revision: u32,

    /// Ordered root of the task tree
    pub tasks: Vec<Task>,

    /// Trigger declarations: upstream flows whose completion starts this one
    #[serde(default)]
    pub triggers: Vec<FlowTrigger>,
}

impl Flow {
    /// Revisioned identity string, the directory's primary key
    pub fn uid(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.id, self.revision)
    }

    /// Identity string without the revision
    pub fn uid_without_revision(&self) -> String {
        format!("{}_{}", self.namespace, self.id)
    }

    /// Find a task anywhere in the tree by its id
    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        find_in(&self.tasks, task_id)
    }

    /// Validate the definition before it enters the directory.
    ///
    /// Checks required fields and the structural soundness of the task
    /// tree. A failing flow is dropped at the directory boundary; it never
    /// reaches the reducer.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.namespace.is_empty() {
            return Err(CoreError::Validation("flow namespace is empty".to_string()));
        }
        if self.id.is_empty() {
            return Err(CoreError::Validation("flow id is empty".to_string()));
        }
        if self.revision < 1 {
            return Err(CoreError::Validation(format!(
                "flow {} revision must be >= 1",
                self.id
            )));
        }
        if self.tasks.is_empty() {
            return Err(CoreError::Validation(format!(
                "flow {} has no tasks",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        validate_tasks(&self.tasks, &mut seen)?;

        for trigger in &self.triggers {
            if trigger.id.is_empty() {
                return Err(CoreError::Validation(format!(
                    "flow {} has a trigger without an id",
                    self.id
                )));
            }
            if trigger.flows.is_empty() {
                return Err(CoreError::Validation(format!(
                    "trigger {} of flow {} names no source flows",
                    trigger.id, self.id
                )));
            }
        }

        Ok(())
    }
}

fn find_in<'a>(tasks: &'a [Task], task_id: &str) -> Option<&'a Task> {
    for task in tasks {
        if task.id == task_id {
            return Some(task);
        }
        if let Some(found) = find_in(task.kind.child_tasks(), task_id) {
            return Some(found);
        }
    }
    None
}

fn validate_tasks(tasks: &[Task], seen: &mut HashSet<String>) -> Result<(), CoreError> {
    for task in tasks {
        if task.id.is_empty() {
            return Err(CoreError::Validation("task id is empty".to_string()));
        }
        if !seen.insert(task.id.clone()) {
            return Err(CoreError::Validation(format!(
                "duplicate task id: {}",
                task.id
            )));
        }

        match &task.kind {
            TaskKind::Runnable { task_type, .. } => {
                if task_type.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "task {} has an empty task_type",
                        task.id
                    )));
                }
            }
            TaskKind::Pause { delay_seconds } => {
                if *delay_seconds == 0 {
                    return Err(CoreError::Validation(format!(
                        "pause task {} has a zero delay",
                        task.id
                    )));
                }
            }
            TaskKind::Sequential { tasks }
            | TaskKind::Parallel { tasks }
            | TaskKind::Subflow { tasks } => {
                if tasks.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "composite task {} has no children",
                        task.id
                    )));
                }
                validate_tasks(tasks, seen)?;
            }
            TaskKind::ForEach { tasks, .. } => {
                // values may be unresolved at publish time; that only fails
                // at expansion
                if tasks.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "composite task {} has no children",
                        task.id
                    )));
                }
                validate_tasks(tasks, seen)?;
            }
        }
    }
    Ok(())
}

/// A node in a flow's task tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Path-stable task identifier, unique within the flow
    pub id: String,

    /// Behavior variant
    #[serde(flatten)]
    pub kind: TaskKind,
}

/// The closed set of task behaviors.
///
/// Composite behavior is dispatched by tag: each variant knows, given its
/// current children, which children to create next and which state it
/// resolves to once they settle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Leaf task executed by a worker process
    Runnable {
        /// Worker-side task type name
        task_type: String,

        /// Opaque configuration forwarded in the dispatch envelope
        #[serde(default)]
        config: Value,
    },

    /// Children run one after another; a failure halts the sequence
    Sequential {
        /// Ordered child tasks
        tasks: Vec<Task>,
    },

    /// All children created at once, running side by side
    Parallel {
        /// Child tasks
        tasks: Vec<Task>,
    },

    /// One child per iteration value per child task, all created together
    ForEach {
        /// Iteration values; absent or empty values fail at expansion
        #[serde(default)]
        values: Option<Vec<Value>>,

        /// Child task templates instantiated per value
        tasks: Vec<Task>,
    },

    /// A worker-pinned child group: the group is dispatched as one envelope
    /// and the pool reports the children's task runs back
    Subflow {
        /// Child tasks executed by the pinned worker
        tasks: Vec<Task>,
    },

    /// Suspends the execution for a fixed delay, handled by the delay
    /// scheduler rather than a worker
    Pause {
        /// Delay before the execution is promoted back to running
        delay_seconds: u64,
    },
}

impl TaskKind {
    /// Whether this variant owns child tasks
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            TaskKind::Sequential { .. }
                | TaskKind::Parallel { .. }
                | TaskKind::ForEach { .. }
                | TaskKind::Subflow { .. }
        )
    }

    /// The declared child tasks, empty for leaves
    pub fn child_tasks(&self) -> &[Task] {
        match self {
            TaskKind::Sequential { tasks }
            | TaskKind::Parallel { tasks }
            | TaskKind::ForEach { tasks, .. }
            | TaskKind::Subflow { tasks } => tasks,
            TaskKind::Runnable { .. } | TaskKind::Pause { .. } => &[],
        }
    }

    /// Given the composite's current children, compute which children to
    /// create next and the state the composite resolves to, if any.
    ///
    /// `children` must be the composite's direct children in creation
    /// order. Leaves return an empty plan.
    pub fn plan(&self, children: &[&TaskRun]) -> TaskPlan {
        match self {
            TaskKind::Runnable { .. } | TaskKind::Pause { .. } => TaskPlan::empty(),
            TaskKind::Sequential { tasks } => sequential_plan(tasks, children),
            TaskKind::Parallel { tasks } => all_at_once_plan(specs_of(tasks), children),
            TaskKind::ForEach { values, tasks } => match values {
                Some(values) if !values.is_empty() => {
                    all_at_once_plan(foreach_specs(values, tasks), children)
                }
                _ => TaskPlan::resolved(Status::Failed),
            },
            // The group itself goes to a worker; children are absorbed from
            // pool reports, never created here.
            TaskKind::Subflow { tasks } => {
                if children.len() >= tasks.len()
                    && children.iter().all(|c| c.state.is_terminal())
                {
                    TaskPlan::resolved(resolve_terminal(children))
                } else {
                    TaskPlan::empty()
                }
            }
        }
    }
}

/// A child task run to be created by the reducer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    /// Task id of the child to instantiate
    pub task_id: String,

    /// Iteration value, set for ForEach children
    pub value: Option<String>,
}

/// Outcome of evaluating a composite against its current children
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskPlan {
    /// Children to create, in declared order
    pub to_create: Vec<ChildSpec>,

    /// The composite's own resulting state, once its children settle
    pub resolved: Option<Status>,
}

impl TaskPlan {
    /// A plan that neither creates children nor resolves
    pub fn empty() -> Self {
        Self::default()
    }

    /// A plan that resolves to the given status without creating children
    pub fn resolved(status: Status) -> Self {
        Self {
            to_create: Vec::new(),
            resolved: Some(status),
        }
    }
}

/// Plan a sequential task list: children are created one at a time, and a
/// failed or killed child halts creation of its later siblings.
///
/// Also used by the reducer for the implicit sequence at the root of every
/// flow.
pub fn sequential_plan(tasks: &[Task], children: &[&TaskRun]) -> TaskPlan {
    if tasks.is_empty() {
        return TaskPlan::resolved(Status::Success);
    }

    match children.last() {
        None => TaskPlan {
            to_create: vec![ChildSpec {
                task_id: tasks[0].id.clone(),
                value: None,
            }],
            resolved: None,
        },
        Some(last) => match last.state.current() {
            Status::Failed => TaskPlan::resolved(Status::Failed),
            Status::Killed => TaskPlan::resolved(Status::Killed),
            s if !s.is_terminal() => TaskPlan::empty(),
            _ => {
                if children.len() < tasks.len() {
                    TaskPlan {
                        to_create: vec![ChildSpec {
                            task_id: tasks[children.len()].id.clone(),
                            value: None,
                        }],
                        resolved: None,
                    }
                } else {
                    TaskPlan::resolved(resolve_terminal(children))
                }
            }
        },
    }
}

/// Resolve the status of a composite whose children are all terminal:
/// a failure wins over a kill, a kill wins over success.
pub fn resolve_terminal(children: &[&TaskRun]) -> Status {
    if children
        .iter()
        .any(|c| c.state.current() == Status::Failed)
    {
        Status::Failed
    } else if children
        .iter()
        .any(|c| c.state.current() == Status::Killed)
    {
        Status::Killed
    } else {
        Status::Success
    }
}

fn specs_of(tasks: &[Task]) -> Vec<ChildSpec> {
    tasks
        .iter()
        .map(|t| ChildSpec {
            task_id: t.id.clone(),
            value: None,
        })
        .collect()
}

fn foreach_specs(values: &[Value], tasks: &[Task]) -> Vec<ChildSpec> {
    let mut specs = Vec::with_capacity(values.len() * tasks.len());
    for value in values {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        for task in tasks {
            specs.push(ChildSpec {
                task_id: task.id.clone(),
                value: Some(rendered.clone()),
            });
        }
    }
    specs
}

fn all_at_once_plan(specs: Vec<ChildSpec>, children: &[&TaskRun]) -> TaskPlan {
    if children.is_empty() {
        if specs.is_empty() {
            TaskPlan::resolved(Status::Success)
        } else {
            TaskPlan {
                to_create: specs,
                resolved: None,
            }
        }
    } else if children.len() >= specs.len() && children.iter().all(|c| c.state.is_terminal()) {
        TaskPlan::resolved(resolve_terminal(children))
    } else {
        TaskPlan::empty()
    }
}

/// A trigger declaration: this flow starts when all of its source flows
/// have completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowTrigger {
    /// Trigger identifier, unique within the flow
    pub id: String,

    /// Upstream flows whose completion this trigger waits for
    pub flows: Vec<FlowRef>,
}

/// Reference to a flow by identity, without a revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRef {
    /// Namespace of the referenced flow
    pub namespace: String,

    /// Id of the referenced flow
    pub id: String,
}

impl FlowRef {
    /// Whether this reference names the given flow
    pub fn matches(&self, namespace: &str, flow_id: &str) -> bool {
        self.namespace == namespace && self.id == flow_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::TaskRun;
    use serde_json::json;

    fn runnable(id: &str) -> Task {
        Task {
            id: id.to_string(),
            kind: TaskKind::Runnable {
                task_type: "log".to_string(),
                config: Value::Null,
            },
        }
    }

    fn run_with(task_id: &str, status: Status) -> TaskRun {
        let mut run = TaskRun::new("exec", task_id, None, None);
        if status != Status::Created {
            run.state = run.state.transition(status);
        }
        run
    }

    fn flow_of(tasks: Vec<Task>) -> Flow {
        Flow {
            namespace: "unit.test".to_string(),
            id: "flow".to_string(),
            revision: 1,
            tasks,
            triggers: Vec::new(),
        }
    }

    #[test]
    fn test_uid() {
        let flow = flow_of(vec![runnable("a")]);
        assert_eq!(flow.uid(), "unit.test_flow_1");
        assert_eq!(flow.uid_without_revision(), "unit.test_flow");
    }

    #[test]
    fn test_find_task_nested() {
        let flow = flow_of(vec![Task {
            id: "par".to_string(),
            kind: TaskKind::Parallel {
                tasks: vec![runnable("a"), runnable("b")],
            },
        }]);

        assert!(flow.find_task("par").is_some());
        assert_eq!(flow.find_task("b").unwrap().id, "b");
        assert!(flow.find_task("missing").is_none());
    }

    #[test]
    fn test_validate_ok() {
        let flow = flow_of(vec![runnable("a"), runnable("b")]);
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let mut flow = flow_of(vec![runnable("a")]);
        flow.id = String::new();

        match flow.validate() {
            Err(CoreError::Validation(msg)) => assert!(msg.contains("flow id")),
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_duplicate_task_ids() {
        let flow = flow_of(vec![runnable("a"), runnable("a")]);

        match flow.validate() {
            Err(CoreError::Validation(msg)) => assert!(msg.contains("duplicate task id")),
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_composite() {
        let flow = flow_of(vec![Task {
            id: "par".to_string(),
            kind: TaskKind::Parallel { tasks: vec![] },
        }]);

        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_deserialize_tagged_task() {
        let flow: Flow = serde_json::from_value(json!({
            "namespace": "unit.test",
            "id": "tagged",
            "revision": 1,
            "tasks": [
                {"id": "first", "type": "runnable", "task_type": "log"},
                {"id": "group", "type": "parallel", "tasks": [
                    {"id": "inner", "type": "runnable", "task_type": "log"}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(flow.tasks.len(), 2);
        assert!(matches!(flow.tasks[1].kind, TaskKind::Parallel { .. }));
    }

    #[test]
    fn test_sequential_plan_steps_one_at_a_time() {
        let tasks = vec![runnable("a"), runnable("b"), runnable("c")];

        // nothing created yet: first child only
        let plan = sequential_plan(&tasks, &[]);
        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(plan.to_create[0].task_id, "a");
        assert_eq!(plan.resolved, None);

        // first child still running: no progress
        let a_running = run_with("a", Status::Running);
        let plan = sequential_plan(&tasks, &[&a_running]);
        assert!(plan.to_create.is_empty());
        assert_eq!(plan.resolved, None);

        // first child done: second child due
        let a_done = run_with("a", Status::Success);
        let plan = sequential_plan(&tasks, &[&a_done]);
        assert_eq!(plan.to_create[0].task_id, "b");
    }

    #[test]
    fn test_sequential_plan_failure_halts() {
        let tasks = vec![runnable("a"), runnable("b")];
        let a_failed = run_with("a", Status::Failed);

        let plan = sequential_plan(&tasks, &[&a_failed]);
        assert!(plan.to_create.is_empty());
        assert_eq!(plan.resolved, Some(Status::Failed));
    }

    #[test]
    fn test_sequential_plan_success_when_all_done() {
        let tasks = vec![runnable("a"), runnable("b")];
        let a = run_with("a", Status::Success);
        let b = run_with("b", Status::Success);

        let plan = sequential_plan(&tasks, &[&a, &b]);
        assert_eq!(plan.resolved, Some(Status::Success));
    }

    #[test]
    fn test_parallel_plan_creates_all_children_at_once() {
        let kind = TaskKind::Parallel {
            tasks: vec![runnable("a"), runnable("b"), runnable("c")],
        };

        let plan = kind.plan(&[]);
        let ids: Vec<&str> = plan.to_create.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parallel_plan_waits_for_running_siblings() {
        let kind = TaskKind::Parallel {
            tasks: vec![runnable("a"), runnable("b")],
        };
        let a = run_with("a", Status::Failed);
        let b = run_with("b", Status::Running);

        // a failed but b still running: not resolved yet
        let plan = kind.plan(&[&a, &b]);
        assert_eq!(plan.resolved, None);

        // b settles: failure wins
        let b = run_with("b", Status::Success);
        let plan = kind.plan(&[&a, &b]);
        assert_eq!(plan.resolved, Some(Status::Failed));
    }

    #[test]
    fn test_foreach_plan_expands_values() {
        let kind = TaskKind::ForEach {
            values: Some(vec![json!("x"), json!("y")]),
            tasks: vec![runnable("t")],
        };

        let plan = kind.plan(&[]);
        assert_eq!(plan.to_create.len(), 2);
        assert_eq!(plan.to_create[0].value.as_deref(), Some("x"));
        assert_eq!(plan.to_create[1].value.as_deref(), Some("y"));
    }

    #[test]
    fn test_foreach_plan_fails_on_absent_values() {
        let kind = TaskKind::ForEach {
            values: None,
            tasks: vec![runnable("t")],
        };

        let plan = kind.plan(&[]);
        assert!(plan.to_create.is_empty());
        assert_eq!(plan.resolved, Some(Status::Failed));
    }

    #[test]
    fn test_subflow_plan_never_creates_children() {
        let kind = TaskKind::Subflow {
            tasks: vec![runnable("a"), runnable("b")],
        };

        assert!(kind.plan(&[]).to_create.is_empty());

        // resolves once every declared child has reported terminal
        let a = run_with("a", Status::Success);
        let b = run_with("b", Status::Success);
        let plan = kind.plan(&[&a, &b]);
        assert_eq!(plan.resolved, Some(Status::Success));
    }
}
