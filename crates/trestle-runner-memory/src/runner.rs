use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use trestle_core::{
    CoreError, Effect, Execution, ExecutionKilled, ExecutionReducer, ExecutorEvent, FleetEffect,
    FleetEvent, FleetTracker, Flow, FlowDirectory, Status, TriggerAggregator, WorkerInstance,
    WorkerTask, WorkerTaskResult, WorkerTaskRunning,
};

/// How often the delay scheduler's wall-clock tick fires
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Task-type logic for the embedded worker pool.
///
/// The returned status must be terminal; it becomes the task run's final
/// worker-reported state.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute one dispatched task
    async fn execute(&self, worker_task: &WorkerTask) -> Result<Status, CoreError>;
}

enum RunnerEvent {
    Executor(ExecutorEvent),
    Fleet(FleetEvent),
}

/// In-memory runtime around the core services.
///
/// All mutation events funnel through one unbounded queue drained by a
/// single task, which gives the reducer its single-writer-per-execution
/// discipline. Effects are routed as they are produced: execution updates
/// to a broadcast channel, dispatches to the worker-task channel, lease
/// releases into the fleet tracker, and trigger events through the
/// aggregator and back into the queue.
pub struct MemoryRunner {
    directory: Arc<FlowDirectory>,
    reducer: Arc<ExecutionReducer>,
    events_tx: mpsc::UnboundedSender<RunnerEvent>,
    updates_tx: broadcast::Sender<Execution>,
    worker_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerTask>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryRunner {
    /// Create a runner and start its event loop and tick task
    pub fn new() -> Self {
        let directory = Arc::new(FlowDirectory::new());
        let reducer = Arc::new(ExecutionReducer::new(directory.clone()));
        let fleet = Arc::new(FleetTracker::new());
        let aggregator = Arc::new(TriggerAggregator::new(directory.clone()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(256);

        let loop_handle = tokio::spawn(run_loop(
            reducer.clone(),
            fleet,
            aggregator,
            events_rx,
            events_tx.clone(),
            worker_tx,
            updates_tx.clone(),
        ));

        let tick_tx = events_tx.clone();
        let tick_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                if tick_tx
                    .send(RunnerEvent::Executor(ExecutorEvent::Tick(Utc::now())))
                    .is_err()
                {
                    return;
                }
            }
        });

        Self {
            directory,
            reducer,
            events_tx,
            updates_tx,
            worker_rx: Mutex::new(Some(worker_rx)),
            tasks: Mutex::new(vec![loop_handle, tick_handle]),
        }
    }

    /// The flow directory this runner resolves against
    pub fn directory(&self) -> Arc<FlowDirectory> {
        self.directory.clone()
    }

    /// Publish a flow definition
    pub fn publish_flow(&self, flow: Flow) {
        self.directory.put(flow);
    }

    /// Create and enqueue a new execution of the given flow
    pub fn start_execution(&self, flow: &Flow) -> Execution {
        let execution = Execution::new(&flow.namespace, &flow.id, flow.revision);
        self.submit(ExecutorEvent::Execution(execution.clone()));
        execution
    }

    /// Enqueue a worker result
    pub fn submit_result(&self, result: WorkerTaskResult) {
        self.submit(ExecutorEvent::WorkerResult(result));
    }

    /// Enqueue a kill request
    pub fn kill(&self, execution_id: &str) {
        self.submit(ExecutorEvent::Killed(ExecutionKilled {
            execution_id: execution_id.to_string(),
        }));
    }

    /// Announce a worker instance to the fleet tracker
    pub fn register_instance(&self, instance: WorkerInstance) {
        let _ = self
            .events_tx
            .send(RunnerEvent::Fleet(FleetEvent::InstanceRegistered(instance)));
    }

    /// Record a lease for a dispatched task
    pub fn register_lease(&self, lease: WorkerTaskRunning) {
        let _ = self
            .events_tx
            .send(RunnerEvent::Fleet(FleetEvent::LeaseCreated(lease)));
    }

    /// Current snapshot of an execution, if the reducer has seen it
    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.reducer.execution(execution_id)
    }

    /// Subscribe to execution-update snapshots
    pub fn subscribe(&self) -> broadcast::Receiver<Execution> {
        self.updates_tx.subscribe()
    }

    /// Take the dispatched-worker-task channel.
    ///
    /// Either drive it manually (a scripted pool) or hand it to
    /// [`MemoryRunner::spawn_worker`]; it can only be taken once.
    pub fn take_worker_tasks(&self) -> Option<mpsc::UnboundedReceiver<WorkerTask>> {
        self.worker_rx.lock().ok()?.take()
    }

    /// Run an embedded worker: registers the instance, leases every
    /// dispatched task, reports RUNNING and then the handler's outcome.
    ///
    /// Returns false if the worker-task channel was already taken.
    pub fn spawn_worker(&self, instance: WorkerInstance, handler: Arc<dyn TaskHandler>) -> bool {
        let Some(mut worker_rx) = self.take_worker_tasks() else {
            return false;
        };

        self.register_instance(instance.clone());

        let events_tx = self.events_tx.clone();
        let partition = instance.partitions.first().copied().unwrap_or(0);
        let handle = tokio::spawn(async move {
            while let Some(worker_task) = worker_rx.recv().await {
                let lease = WorkerTaskRunning::of(worker_task.clone(), instance.clone(), partition);
                let _ = events_tx.send(RunnerEvent::Fleet(FleetEvent::LeaseCreated(lease)));

                let mut task_run = worker_task.task_run.clone();
                task_run.state = task_run.state.transition(Status::Running);
                let _ = events_tx.send(RunnerEvent::Executor(ExecutorEvent::WorkerResult(
                    WorkerTaskResult::new(task_run.clone()),
                )));

                let outcome = match handler.execute(&worker_task).await {
                    Ok(status) => status,
                    Err(err) => {
                        error!(
                            task_run_id = %worker_task.task_run.id,
                            error = %err,
                            "Task handler failed"
                        );
                        Status::Failed
                    }
                };

                task_run.state = task_run.state.transition(outcome);
                let _ = events_tx.send(RunnerEvent::Executor(ExecutorEvent::WorkerResult(
                    WorkerTaskResult::new(task_run),
                )));
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        true
    }

    fn submit(&self, event: ExecutorEvent) {
        let _ = self.events_tx.send(RunnerEvent::Executor(event));
    }
}

impl Default for MemoryRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryRunner {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

async fn run_loop(
    reducer: Arc<ExecutionReducer>,
    fleet: Arc<FleetTracker>,
    aggregator: Arc<TriggerAggregator>,
    mut events_rx: mpsc::UnboundedReceiver<RunnerEvent>,
    events_tx: mpsc::UnboundedSender<RunnerEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerTask>,
    updates_tx: broadcast::Sender<Execution>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            RunnerEvent::Executor(event) => match reducer.handle(event) {
                Ok(effects) => route_effects(
                    effects,
                    &fleet,
                    &aggregator,
                    &events_tx,
                    &worker_tx,
                    &updates_tx,
                ),
                Err(err) => error!(error = %err, "Reduction failed"),
            },
            RunnerEvent::Fleet(event) => match fleet.handle(event) {
                Ok(effects) => route_fleet_effects(effects, &events_tx),
                Err(err) => error!(error = %err, "Fleet tracking failed"),
            },
        }
    }
}

fn route_effects(
    effects: Vec<Effect>,
    fleet: &FleetTracker,
    aggregator: &TriggerAggregator,
    events_tx: &mpsc::UnboundedSender<RunnerEvent>,
    worker_tx: &mpsc::UnboundedSender<WorkerTask>,
    updates_tx: &broadcast::Sender<Execution>,
) {
    for effect in effects {
        match effect {
            Effect::ExecutionUpdated(execution) => {
                // no subscribers is fine
                let _ = updates_tx.send(execution);
            }
            Effect::WorkerTaskDispatched(worker_task) => {
                let _ = worker_tx.send(worker_task);
            }
            Effect::LeaseReleased(task_run_id) => {
                match fleet.handle(FleetEvent::LeaseReleased(task_run_id)) {
                    Ok(effects) => route_fleet_effects(effects, events_tx),
                    Err(err) => error!(error = %err, "Lease release failed"),
                }
            }
            Effect::Trigger(event) => match aggregator.handle(event) {
                Ok(fired) => {
                    // explicit re-injection: trigger-created executions take
                    // the same queue as externally created ones
                    for execution in fired {
                        let _ = events_tx
                            .send(RunnerEvent::Executor(ExecutorEvent::Execution(execution)));
                    }
                }
                Err(err) => error!(error = %err, "Trigger aggregation failed"),
            },
        }
    }
}

fn route_fleet_effects(effects: Vec<FleetEffect>, events_tx: &mpsc::UnboundedSender<RunnerEvent>) {
    for effect in effects {
        match effect {
            FleetEffect::LeaseDeleted(task_run_id) => {
                debug!(task_run_id = %task_run_id, "Lease record deleted");
            }
            FleetEffect::Redelivery(worker_task) => {
                let _ = events_tx.send(RunnerEvent::Executor(ExecutorEvent::Redelivery(
                    worker_task,
                )));
            }
        }
    }
}
