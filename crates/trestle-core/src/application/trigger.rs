//! The flow trigger aggregator: turns execution completions into new
//! executions of the flows listening for them.
//!
//! A single-source trigger fires on the first event. A multi-source
//! trigger buffers upstream completions per (listener, trigger) until every
//! declared source has reported, fires exactly once and clears its buffer.
//! Events carrying a superseded listener revision are ignored; only the
//! highest published revision of a listener evaluates conditions.

use crate::application::directory::FlowDirectory;
use crate::domain::execution::Execution;
use crate::domain::flow::Flow;
use crate::error::CoreError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Emitted when an execution some flow listens to reaches SUCCESS.
///
/// Carries the completed execution and the definition of the listening
/// flow, so the aggregator can evaluate conditions without another
/// directory round-trip.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// The completed upstream execution
    pub execution: Execution,

    /// The flow listening for it
    pub listener: Flow,
}

/// Aggregates trigger events into execution-creation requests
pub struct TriggerAggregator {
    directory: Arc<FlowDirectory>,
    waiting: Mutex<HashMap<String, HashSet<String>>>,
}

impl TriggerAggregator {
    /// Create an aggregator deduplicating against the given directory
    pub fn new(directory: Arc<FlowDirectory>) -> Self {
        Self {
            directory,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one trigger event; returns the executions to create.
    ///
    /// The returned executions are in CREATED and must be re-injected into
    /// the reducer's input queue, not evaluated in-process, so they get the
    /// same ordering and idempotence guarantees as any other execution.
    pub fn handle(&self, event: TriggerEvent) -> Result<Vec<Execution>, CoreError> {
        let listener = &event.listener;

        if let Some(latest) = self.directory.latest(&listener.namespace, &listener.id) {
            if listener.revision < latest.revision {
                debug!(
                    listener = %listener.uid(),
                    latest_revision = latest.revision,
                    "Ignoring trigger event for superseded listener revision"
                );
                return Ok(Vec::new());
            }
        }

        let source_namespace = &event.execution.namespace;
        let source_id = &event.execution.flow_id;

        let mut fired = Vec::new();
        for trigger in &listener.triggers {
            if !trigger
                .flows
                .iter()
                .any(|f| f.matches(source_namespace, source_id))
            {
                continue;
            }

            if trigger.flows.len() == 1 {
                fired.push(self.fire(listener, &trigger.id));
                continue;
            }

            let key = format!("{}|{}", listener.uid_without_revision(), trigger.id);
            let mut waiting = self.lock_waiting()?;
            let received = waiting.entry(key.clone()).or_default();
            received.insert(format!("{}_{}", source_namespace, source_id));

            let satisfied = trigger
                .flows
                .iter()
                .all(|f| received.contains(&format!("{}_{}", f.namespace, f.id)));

            if satisfied {
                waiting.remove(&key);
                drop(waiting);
                fired.push(self.fire(listener, &trigger.id));
            }
        }

        Ok(fired)
    }

    fn fire(&self, listener: &Flow, trigger_id: &str) -> Execution {
        info!(
            listener = %listener.uid(),
            trigger_id = %trigger_id,
            "Trigger fired, creating execution"
        );
        Execution::new(&listener.namespace, &listener.id, listener.revision)
    }

    fn lock_waiting(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, HashSet<String>>>, CoreError> {
        self.waiting
            .lock()
            .map_err(|e| CoreError::Other(format!("Trigger buffer lock poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::{FlowRef, FlowTrigger, Task, TaskKind};
    use crate::domain::state::Status;

    fn simple_flow(id: &str, revision: u32) -> Flow {
        Flow {
            namespace: "unit.test".to_string(),
            id: id.to_string(),
            revision,
            tasks: vec![Task {
                id: format!("{}-task", id),
                kind: TaskKind::Runnable {
                    task_type: "log".to_string(),
                    config: serde_json::Value::Null,
                },
            }],
            triggers: Vec::new(),
        }
    }

    fn listener_on(sources: &[&str], revision: u32) -> Flow {
        let mut flow = simple_flow("listener", revision);
        flow.triggers = vec![FlowTrigger {
            id: "on-upstream".to_string(),
            flows: sources
                .iter()
                .map(|id| FlowRef {
                    namespace: "unit.test".to_string(),
                    id: id.to_string(),
                })
                .collect(),
        }];
        flow
    }

    fn completed(flow_id: &str) -> Execution {
        let mut execution = Execution::new("unit.test", flow_id, 1);
        execution.state = execution
            .state
            .transition(Status::Running)
            .transition(Status::Success);
        execution
    }

    fn aggregator_with(flows: &[&Flow]) -> TriggerAggregator {
        let directory = Arc::new(FlowDirectory::new());
        for flow in flows {
            directory.put((*flow).clone());
        }
        TriggerAggregator::new(directory)
    }

    #[test]
    fn test_single_source_fires_immediately() {
        let listener = listener_on(&["flow-a"], 1);
        let aggregator = aggregator_with(&[&listener]);

        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("flow-a"),
                listener: listener.clone(),
            })
            .unwrap();

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].flow_id, "listener");
        assert_eq!(fired[0].state.current(), Status::Created);
    }

    #[test]
    fn test_stale_revision_event_is_ignored() {
        let listener_v1 = listener_on(&["flow-a"], 1);
        let listener_v2 = listener_on(&["flow-a"], 2);
        let aggregator = aggregator_with(&[&listener_v1, &listener_v2]);

        // the event still carrying revision 1 is superseded
        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("flow-a"),
                listener: listener_v1,
            })
            .unwrap();
        assert!(fired.is_empty());

        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("flow-a"),
                listener: listener_v2,
            })
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].flow_revision, 2);
    }

    #[test]
    fn test_multi_source_waits_for_every_flow() {
        let listener = listener_on(&["flow-a", "flow-b"], 1);
        let aggregator = aggregator_with(&[&listener]);

        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("flow-a"),
                listener: listener.clone(),
            })
            .unwrap();
        assert!(fired.is_empty());

        // the same upstream again does not complete the condition
        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("flow-a"),
                listener: listener.clone(),
            })
            .unwrap();
        assert!(fired.is_empty());

        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("flow-b"),
                listener: listener.clone(),
            })
            .unwrap();
        assert_eq!(fired.len(), 1);

        // the buffer was cleared: one more completion does not re-fire
        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("flow-b"),
                listener,
            })
            .unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn test_unrelated_completion_is_ignored() {
        let listener = listener_on(&["flow-a"], 1);
        let aggregator = aggregator_with(&[&listener]);

        let fired = aggregator
            .handle(TriggerEvent {
                execution: completed("other-flow"),
                listener,
            })
            .unwrap();
        assert!(fired.is_empty());
    }
}
