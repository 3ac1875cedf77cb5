//! The execution reducer: the central state machine of the engine.
//!
//! The reducer consumes mutation events keyed by execution id (creation
//! requests, worker results, kill requests, redeliveries, wall-clock
//! ticks), joins them against the flow directory and deterministically
//! computes the next snapshot of the execution and its task-run tree,
//! emitting dispatches and trigger events along the way. Reduction is a
//! pure function of (stored snapshot, event): replays after a crash
//! recompute identical effects, and duplicate deliveries that change
//! nothing emit nothing.

use crate::application::directory::FlowDirectory;
use crate::application::trigger::TriggerEvent;
use crate::domain::execution::{Execution, ExecutionKilled, TaskRun};
use crate::domain::flow::{sequential_plan, ChildSpec, Flow, TaskKind};
use crate::domain::state::Status;
use crate::domain::worker::{RunContext, WorkerTask, WorkerTaskResult};
use crate::error::CoreError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A mutation event consumed by the reducer, keyed by execution id
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// A new execution entering the engine (or a replayed creation request)
    Execution(Execution),

    /// A worker's report of a task run's new state
    WorkerResult(WorkerTaskResult),

    /// A cooperative cancellation request
    Killed(ExecutionKilled),

    /// A redelivery request from the fleet tracker after a lost lease
    Redelivery(WorkerTask),

    /// A wall-clock tick driving the delay scheduler
    Tick(DateTime<Utc>),
}

/// An externally observable effect of one reduction
#[derive(Debug, Clone)]
pub enum Effect {
    /// The execution snapshot was replaced
    ExecutionUpdated(Execution),

    /// A unit of work was dispatched to the worker pool
    WorkerTaskDispatched(WorkerTask),

    /// A task run reached a terminal state; its lease can be dropped
    LeaseReleased(String),

    /// A completed execution matched a downstream listener
    Trigger(TriggerEvent),
}

struct DelayEntry {
    task_run_id: String,
    deadline: DateTime<Utc>,
}

/// The central state machine.
///
/// Owns every execution snapshot exclusively; a snapshot is only ever
/// replaced whole. Callers must uphold the single-writer-per-execution
/// discipline: all events for one execution id go through one processing
/// unit in arrival order.
pub struct ExecutionReducer {
    directory: Arc<FlowDirectory>,
    executions: DashMap<String, Execution>,
    delays: Mutex<HashMap<String, Vec<DelayEntry>>>,
    parked: Mutex<Vec<ExecutorEvent>>,
}

impl ExecutionReducer {
    /// Create a reducer resolving flows against the given directory
    pub fn new(directory: Arc<FlowDirectory>) -> Self {
        Self {
            directory,
            executions: DashMap::new(),
            delays: Mutex::new(HashMap::new()),
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Current snapshot of an execution, if known
    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions
            .get(execution_id)
            .map(|entry| entry.value().clone())
    }

    /// Reduce one event, returning the effects to route.
    ///
    /// Events parked on an unresolvable flow revision are retried first, so
    /// a directory update that has since arrived unblocks them without any
    /// dedicated input.
    pub fn handle(&self, event: ExecutorEvent) -> Result<Vec<Effect>, CoreError> {
        let mut effects = Vec::new();

        let retries: Vec<ExecutorEvent> = {
            let mut parked = self.lock_parked()?;
            parked.drain(..).collect()
        };
        for retry in retries {
            self.process(retry, &mut effects)?;
        }

        self.process(event, &mut effects)?;
        Ok(effects)
    }

    fn process(&self, event: ExecutorEvent, effects: &mut Vec<Effect>) -> Result<(), CoreError> {
        match event {
            ExecutorEvent::Execution(execution) => self.on_execution(execution, effects),
            ExecutorEvent::WorkerResult(result) => self.on_worker_result(result, effects),
            ExecutorEvent::Killed(killed) => self.on_killed(killed, effects),
            ExecutorEvent::Redelivery(worker_task) => self.on_redelivery(worker_task, effects),
            ExecutorEvent::Tick(now) => self.on_tick(now, effects),
        }
    }

    fn on_execution(
        &self,
        execution: Execution,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CoreError> {
        if self.executions.contains_key(&execution.id) {
            debug!(execution_id = %execution.id, "Duplicate execution request ignored");
            return Ok(());
        }

        let Some(flow) = self.resolve_flow(&execution) else {
            return self.park(ExecutorEvent::Execution(execution));
        };

        info!(
            execution_id = %execution.id,
            flow_id = %execution.flow_id,
            revision = execution.flow_revision,
            "Accepting execution"
        );

        let mut execution = execution;
        self.evaluate(&flow, &mut execution, effects)?;
        self.store(execution, effects);
        Ok(())
    }

    fn on_worker_result(
        &self,
        result: WorkerTaskResult,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CoreError> {
        let execution_id = result.task_run.execution_id.clone();
        let Some(mut execution) = self.execution(&execution_id) else {
            warn!(
                execution_id = %execution_id,
                task_run_id = %result.task_run.id,
                "Worker result for unknown execution ignored"
            );
            return Ok(());
        };

        let Some(flow) = self.resolve_flow(&execution) else {
            return self.park(ExecutorEvent::WorkerResult(result));
        };

        let reported = result.task_run.state.current();
        if !merge_result(&mut execution, &result) {
            debug!(
                execution_id = %execution_id,
                task_run_id = %result.task_run.id,
                "Late or duplicate worker result ignored"
            );
            return Ok(());
        }

        if reported.is_terminal() {
            effects.push(Effect::LeaseReleased(result.task_run.id.clone()));
        }

        self.evaluate(&flow, &mut execution, effects)?;
        self.store(execution, effects);
        Ok(())
    }

    fn on_killed(
        &self,
        killed: ExecutionKilled,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CoreError> {
        let Some(mut execution) = self.execution(&killed.execution_id) else {
            warn!(execution_id = %killed.execution_id, "Kill for unknown execution ignored");
            return Ok(());
        };

        if execution.state.is_terminal() || execution.state.current() == Status::Killing {
            debug!(execution_id = %execution.id, "Kill request is a no-op");
            return Ok(());
        }

        let Some(flow) = self.resolve_flow(&execution) else {
            return self.park(ExecutorEvent::Killed(killed));
        };

        info!(execution_id = %execution.id, "Killing execution");

        for run in execution.task_runs.iter_mut() {
            match run.state.current() {
                // never dispatched: force the outcome directly
                Status::Created | Status::Paused => {
                    run.state = run.state.transition(Status::Killed);
                }
                Status::Running => {
                    let composite = flow
                        .find_task(&run.task_id)
                        .map(|t| t.kind.is_composite())
                        .unwrap_or(false);
                    if composite {
                        run.state = run.state.transition(Status::Killing);
                    }
                    // a running leaf is left to reach its own outcome via a
                    // later worker result
                }
                _ => {}
            }
        }

        execution.state = execution.state.transition(Status::Killing);
        self.cancel_delays(&execution.id)?;

        self.evaluate(&flow, &mut execution, effects)?;
        self.store(execution, effects);
        Ok(())
    }

    fn on_redelivery(
        &self,
        worker_task: WorkerTask,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CoreError> {
        let execution_id = worker_task.task_run.execution_id.clone();
        let Some(mut execution) = self.execution(&execution_id) else {
            warn!(execution_id = %execution_id, "Redelivery for unknown execution ignored");
            return Ok(());
        };

        let task_run_id = worker_task.task_run.id.clone();
        {
            let Some(run) = execution.find_task_run_mut(&task_run_id) else {
                warn!(
                    execution_id = %execution_id,
                    task_run_id = %task_run_id,
                    "Redelivery for unknown task run ignored"
                );
                return Ok(());
            };

            if run.state.is_terminal() {
                debug!(task_run_id = %task_run_id, "Redelivery for terminal task run ignored");
                return Ok(());
            }

            // keep every prior attempt's outcome, reset the run for a fresh
            // dispatch
            run.attempts = worker_task.task_run.attempts.clone();
            run.state = run.state.transition(Status::Created);
        }

        info!(
            execution_id = %execution_id,
            task_run_id = %task_run_id,
            "Redispatching task run after lost lease"
        );

        let refreshed = execution
            .find_task_run(&task_run_id)
            .cloned()
            .ok_or_else(|| CoreError::TaskRunNotFound(task_run_id.clone()))?;
        effects.push(Effect::WorkerTaskDispatched(WorkerTask {
            task_run: refreshed,
            ..worker_task
        }));

        self.store(execution, effects);
        Ok(())
    }

    fn on_tick(&self, now: DateTime<Utc>, effects: &mut Vec<Effect>) -> Result<(), CoreError> {
        let due: Vec<(String, String)> = {
            let mut delays = self.lock_delays()?;
            let mut due = Vec::new();
            for (execution_id, entries) in delays.iter_mut() {
                let mut remaining = Vec::new();
                for entry in entries.drain(..) {
                    if entry.deadline <= now {
                        due.push((execution_id.clone(), entry.task_run_id));
                    } else {
                        remaining.push(entry);
                    }
                }
                *entries = remaining;
            }
            delays.retain(|_, entries| !entries.is_empty());
            due
        };

        for (execution_id, task_run_id) in due {
            let Some(mut execution) = self.execution(&execution_id) else {
                continue;
            };

            let Some(flow) = self.resolve_flow(&execution) else {
                // directory still catching up; keep the deadline armed
                self.lock_delays()?
                    .entry(execution_id)
                    .or_default()
                    .push(DelayEntry {
                        task_run_id,
                        deadline: now,
                    });
                continue;
            };

            if let Some(run) = execution.find_task_run_mut(&task_run_id) {
                if run.state.current() == Status::Paused {
                    run.state = run
                        .state
                        .transition(Status::Running)
                        .transition(Status::Success);
                }
            }

            if execution.state.current() == Status::Paused {
                info!(execution_id = %execution.id, "Delay elapsed, promoting execution");
                execution.state = execution
                    .state
                    .transition(Status::Restarted)
                    .transition(Status::Running);
            }

            self.evaluate(&flow, &mut execution, effects)?;
            self.store(execution, effects);
        }

        Ok(())
    }

    /// Run tree evaluation to a fixpoint: expand composites, dispatch new
    /// leaves, propagate completion, settle the execution state.
    fn evaluate(
        &self,
        flow: &Flow,
        execution: &mut Execution,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CoreError> {
        loop {
            let mut advanced = false;

            let composite_ids: Vec<String> = execution
                .task_runs
                .iter()
                .filter(|run| !run.state.is_terminal())
                .filter(|run| {
                    flow.find_task(&run.task_id)
                        .map(|t| t.kind.is_composite())
                        .unwrap_or(false)
                })
                .map(|run| run.id.clone())
                .collect();

            for task_run_id in composite_ids {
                advanced |= self.advance_composite(flow, execution, &task_run_id, effects)?;
            }

            advanced |= self.advance_root(flow, execution, effects)?;

            if !advanced {
                return Ok(());
            }
        }
    }

    fn advance_composite(
        &self,
        flow: &Flow,
        execution: &mut Execution,
        task_run_id: &str,
        effects: &mut Vec<Effect>,
    ) -> Result<bool, CoreError> {
        let (current, task_id) = {
            let run = execution
                .find_task_run(task_run_id)
                .ok_or_else(|| CoreError::TaskRunNotFound(task_run_id.to_string()))?;
            (run.state.current(), run.task_id.clone())
        };
        if current.is_terminal() {
            return Ok(false);
        }

        let task = flow
            .find_task(&task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.clone()))?
            .clone();

        if execution.state.current() == Status::Killing {
            // no new children under a kill; settle once the existing ones
            // have drained
            let settled = {
                let children = execution.children_of(task_run_id);
                if children.iter().all(|c| c.state.is_terminal()) {
                    let failed = children
                        .iter()
                        .any(|c| c.state.current() == Status::Failed);
                    Some(if failed { Status::Failed } else { Status::Killed })
                } else {
                    None
                }
            };

            if let Some(status) = settled {
                let run = execution
                    .find_task_run_mut(task_run_id)
                    .ok_or_else(|| CoreError::TaskRunNotFound(task_run_id.to_string()))?;
                run.state = run.state.transition(status);
                return Ok(true);
            }
            return Ok(false);
        }

        // a worker-pinned group is dispatched whole; its children come back
        // from the pool
        if matches!(task.kind, TaskKind::Subflow { .. }) && current == Status::Created {
            let run = execution
                .find_task_run_mut(task_run_id)
                .ok_or_else(|| CoreError::TaskRunNotFound(task_run_id.to_string()))?;
            effects.push(Effect::WorkerTaskDispatched(WorkerTask {
                task_run: run.clone(),
                task: task.clone(),
                run_context: RunContext::default(),
                worker_group: Some(run.id.clone()),
            }));
            run.state = run.state.transition(Status::Running);
            return Ok(true);
        }

        let plan = {
            let children = execution.children_of(task_run_id);
            task.kind.plan(&children)
        };

        let mut advanced = false;

        if !plan.to_create.is_empty() {
            self.create_children(flow, execution, Some(task_run_id), &plan.to_create, effects)?;
            let run = execution
                .find_task_run_mut(task_run_id)
                .ok_or_else(|| CoreError::TaskRunNotFound(task_run_id.to_string()))?;
            if run.state.current() == Status::Created {
                run.state = run.state.transition(Status::Running);
            }
            advanced = true;
        }

        if let Some(status) = plan.resolved {
            let run = execution
                .find_task_run_mut(task_run_id)
                .ok_or_else(|| CoreError::TaskRunNotFound(task_run_id.to_string()))?;
            if run.state.current() != status {
                run.state = run.state.transition(status);
                advanced = true;

                // a pinned group holds its own lease; the pool only reports
                // the children, so release it here
                if matches!(task.kind, TaskKind::Subflow { .. }) {
                    effects.push(Effect::LeaseReleased(task_run_id.to_string()));
                }
            }
        }

        Ok(advanced)
    }

    fn advance_root(
        &self,
        flow: &Flow,
        execution: &mut Execution,
        effects: &mut Vec<Effect>,
    ) -> Result<bool, CoreError> {
        match execution.state.current() {
            status if status.is_terminal() => return Ok(false),
            // suspended; the delay scheduler will promote it
            Status::Paused => return Ok(false),
            Status::Killing => {
                if execution.all_task_runs_terminal() {
                    execution.state = execution.state.transition(Status::Killed);
                    return Ok(true);
                }
                return Ok(false);
            }
            _ => {}
        }

        // the root task list behaves as an implicit sequence
        let plan = {
            let roots = execution.root_task_runs();
            sequential_plan(&flow.tasks, &roots)
        };

        let mut advanced = false;

        if !plan.to_create.is_empty() {
            if execution.state.current() == Status::Created {
                execution.state = execution.state.transition(Status::Running);
            }
            self.create_children(flow, execution, None, &plan.to_create, effects)?;
            advanced = true;
        }

        if let Some(status) = plan.resolved {
            // a pause created this pass may have suspended the execution
            if execution.state.current() != Status::Paused
                && execution.state.current() != status
            {
                if execution.state.current() == Status::Created {
                    execution.state = execution.state.transition(Status::Running);
                }
                execution.state = execution.state.transition(status);
                advanced = true;

                if status == Status::Success {
                    self.emit_triggers(execution, effects);
                }
            }
        }

        Ok(advanced)
    }

    fn create_children(
        &self,
        flow: &Flow,
        execution: &mut Execution,
        parent_task_run_id: Option<&str>,
        specs: &[ChildSpec],
        effects: &mut Vec<Effect>,
    ) -> Result<(), CoreError> {
        for spec in specs {
            let task = flow
                .find_task(&spec.task_id)
                .ok_or_else(|| CoreError::TaskNotFound(spec.task_id.clone()))?
                .clone();

            let mut run = TaskRun::new(
                &execution.id,
                &spec.task_id,
                parent_task_run_id.map(String::from),
                spec.value.clone(),
            );

            match &task.kind {
                TaskKind::Runnable { .. } => {
                    debug!(
                        execution_id = %execution.id,
                        task_id = %spec.task_id,
                        task_run_id = %run.id,
                        "Dispatching task run"
                    );
                    effects.push(Effect::WorkerTaskDispatched(WorkerTask {
                        task_run: run.clone(),
                        task: task.clone(),
                        run_context: RunContext::default(),
                        worker_group: None,
                    }));
                }
                TaskKind::Pause { delay_seconds } => {
                    run.state = run.state.transition(Status::Paused);
                    self.register_delay(&execution.id, &run.id, *delay_seconds)?;
                    if execution.state.current() == Status::Running {
                        execution.state = execution.state.transition(Status::Paused);
                    }
                }
                // composites expand on the next evaluation pass
                _ => {}
            }

            execution.task_runs.push(run);
        }

        Ok(())
    }

    fn emit_triggers(&self, execution: &Execution, effects: &mut Vec<Effect>) {
        for listener in self
            .directory
            .listeners_of(&execution.namespace, &execution.flow_id)
        {
            debug!(
                execution_id = %execution.id,
                listener = %listener.uid(),
                "Execution completion matches a listener"
            );
            effects.push(Effect::Trigger(TriggerEvent {
                execution: execution.clone(),
                listener,
            }));
        }
    }

    fn store(&self, execution: Execution, effects: &mut Vec<Effect>) {
        self.executions
            .insert(execution.id.clone(), execution.clone());
        effects.push(Effect::ExecutionUpdated(execution));
    }

    fn resolve_flow(&self, execution: &Execution) -> Option<Flow> {
        self.directory
            .get(&execution.namespace, &execution.flow_id, execution.flow_revision)
    }

    fn park(&self, event: ExecutorEvent) -> Result<(), CoreError> {
        info!("Flow revision not yet resolvable, deferring event");
        self.lock_parked()?.push(event);
        Ok(())
    }

    fn register_delay(
        &self,
        execution_id: &str,
        task_run_id: &str,
        delay_seconds: u64,
    ) -> Result<(), CoreError> {
        let deadline = Utc::now() + Duration::seconds(delay_seconds as i64);
        self.lock_delays()?
            .entry(execution_id.to_string())
            .or_default()
            .push(DelayEntry {
                task_run_id: task_run_id.to_string(),
                deadline,
            });
        Ok(())
    }

    fn cancel_delays(&self, execution_id: &str) -> Result<(), CoreError> {
        self.lock_delays()?.remove(execution_id);
        Ok(())
    }

    fn lock_delays(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<DelayEntry>>>, CoreError> {
        self.delays
            .lock()
            .map_err(|e| CoreError::Other(format!("Delay registry lock poisoned: {}", e)))
    }

    fn lock_parked(&self) -> Result<std::sync::MutexGuard<'_, Vec<ExecutorEvent>>, CoreError> {
        self.parked
            .lock()
            .map_err(|e| CoreError::Other(format!("Retry buffer lock poisoned: {}", e)))
    }
}

/// Merge a worker result into the execution. Returns whether anything
/// changed; late results for terminal task runs change nothing.
fn merge_result(execution: &mut Execution, result: &WorkerTaskResult) -> bool {
    let reported = result.task_run.state.current();

    if let Some(run) = execution.find_task_run_mut(&result.task_run.id) {
        if run.state.is_terminal() {
            return false;
        }

        let mut changed = false;
        if result.task_run.attempts.len() > run.attempts.len() {
            run.attempts = result.task_run.attempts.clone();
            changed = true;
        }
        if reported != run.state.current() && reported != Status::Created {
            run.state = run.state.transition(reported);
            changed = true;
        }
        changed
    } else {
        if execution.state.is_terminal() {
            return false;
        }
        // a task run the reducer never created: a worker-pinned group child
        // reported by the pool
        execution.task_runs.push(result.task_run.clone());
        true
    }
}
