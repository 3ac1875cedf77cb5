//! The flow directory: a compacted, continuously updated table mapping
//! (namespace, id, revision) to a flow definition.
//!
//! Definitions arrive from the flow repository over the log substrate. A
//! malformed document is logged and dropped at this boundary; the rest of
//! the pipeline keeps operating. Revisions are never overwritten: older
//! revisions stay resolvable for executions still referencing them.

use crate::domain::flow::Flow;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Compacted table of published flow definitions
pub struct FlowDirectory {
    /// Definitions keyed by revisioned uid
    flows: DashMap<String, Flow>,

    /// Highest known revision per unrevisioned uid
    latest: DashMap<String, u32>,
}

impl FlowDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            latest: DashMap::new(),
        }
    }

    /// Publish a definition.
    ///
    /// Validation failures are logged and the record is dropped; the
    /// directory never halts on a bad definition.
    pub fn put(&self, flow: Flow) {
        if let Err(err) = flow.validate() {
            warn!(
                namespace = %flow.namespace,
                flow_id = %flow.id,
                revision = flow.revision,
                error = %err,
                "Dropping invalid flow definition"
            );
            return;
        }

        debug!(uid = %flow.uid(), "Publishing flow definition");

        let unrevisioned = flow.uid_without_revision();
        let revision = flow.revision;
        self.flows.insert(flow.uid(), flow);

        let mut entry = self.latest.entry(unrevisioned).or_insert(revision);
        if *entry < revision {
            *entry = revision;
        }
    }

    /// Publish a raw document as it arrives from the log substrate.
    ///
    /// Deserialization failures (unknown task types, malformed enum fields,
    /// invalid JSON) are logged and dropped.
    pub fn put_raw(&self, raw: &str) {
        match serde_json::from_str::<Flow>(raw) {
            Ok(flow) => self.put(flow),
            Err(err) => {
                warn!(error = %err, "Dropping undecodable flow document");
            }
        }
    }

    /// Resolve a definition by exact revision
    pub fn get(&self, namespace: &str, flow_id: &str, revision: u32) -> Option<Flow> {
        let uid = format!("{}_{}_{}", namespace, flow_id, revision);
        self.flows.get(&uid).map(|entry| entry.value().clone())
    }

    /// Resolve the highest published revision of a flow
    pub fn latest(&self, namespace: &str, flow_id: &str) -> Option<Flow> {
        let unrevisioned = format!("{}_{}", namespace, flow_id);
        let revision = *self.latest.get(&unrevisioned)?.value();
        self.flows
            .get(&format!("{}_{}", unrevisioned, revision))
            .map(|entry| entry.value().clone())
    }

    /// Latest-revision flows declaring a trigger on the given flow
    pub fn listeners_of(&self, namespace: &str, flow_id: &str) -> Vec<Flow> {
        let mut listeners = Vec::new();

        for entry in self.latest.iter() {
            let uid = format!("{}_{}", entry.key(), entry.value());
            let Some(flow) = self.flows.get(&uid) else {
                continue;
            };

            let listens = flow
                .triggers
                .iter()
                .any(|t| t.flows.iter().any(|f| f.matches(namespace, flow_id)));

            if listens {
                listeners.push(flow.value().clone());
            }
        }

        listeners
    }
}

impl Default for FlowDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::{FlowRef, FlowTrigger, Task, TaskKind};

    fn flow(namespace: &str, id: &str, revision: u32) -> Flow {
        Flow {
            namespace: namespace.to_string(),
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

    #[test]
    fn test_put_and_get_by_revision() {
        let directory = FlowDirectory::new();
        directory.put(flow("unit.test", "logs", 1));
        directory.put(flow("unit.test", "logs", 2));

        assert_eq!(directory.get("unit.test", "logs", 1).unwrap().revision, 1);
        assert_eq!(directory.get("unit.test", "logs", 2).unwrap().revision, 2);
        assert!(directory.get("unit.test", "logs", 3).is_none());

        // older revisions stay resolvable after a republish
        assert_eq!(directory.latest("unit.test", "logs").unwrap().revision, 2);
    }

    #[test]
    fn test_invalid_flow_is_dropped() {
        let directory = FlowDirectory::new();

        let mut invalid = flow("unit.test", "bad", 1);
        invalid.tasks.clear();
        directory.put(invalid);

        assert!(directory.get("unit.test", "bad", 1).is_none());
    }

    #[test]
    fn test_put_raw_tolerates_garbage() {
        let directory = FlowDirectory::new();

        directory.put_raw("{not json");
        directory.put_raw(r#"{"id": "invalid", "namespace": "unit.test"}"#);
        directory.put_raw(
            r#"{"namespace": "unit.test", "id": "bad-task", "revision": 1,
                "tasks": [{"id": "t", "type": "no_such_type"}]}"#,
        );

        // a valid flow published afterwards still resolves
        directory.put(flow("unit.test", "good", 1));
        assert!(directory.get("unit.test", "good", 1).is_some());
    }

    #[test]
    fn test_listeners_of_uses_latest_revision_only() {
        let directory = FlowDirectory::new();
        directory.put(flow("unit.test", "upstream", 1));

        let mut listener_v1 = flow("unit.test", "listener", 1);
        listener_v1.triggers = vec![FlowTrigger {
            id: "on-upstream".to_string(),
            flows: vec![FlowRef {
                namespace: "unit.test".to_string(),
                id: "upstream".to_string(),
            }],
        }];
        let mut listener_v2 = listener_v1.clone();
        listener_v2.revision = 2;

        directory.put(listener_v1);
        directory.put(listener_v2);

        let listeners = directory.listeners_of("unit.test", "upstream");
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].revision, 2);

        assert!(directory.listeners_of("unit.test", "unrelated").is_empty());
    }
}
