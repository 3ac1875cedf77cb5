use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an execution or a task run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Known to the reducer, nothing dispatched yet
    Created,

    /// In progress, either on a worker or expanding its children
    Running,

    /// Suspended until a delay deadline elapses
    Paused,

    /// Promoted out of pause, about to run again
    Restarted,

    /// Kill requested, draining in-flight task runs
    Killing,

    /// Terminal: cancelled
    Killed,

    /// Terminal: completed successfully
    Success,

    /// Terminal: completed with an unrecovered failure
    Failed,
}

impl Status {
    /// Whether this status is terminal (no further transitions expected)
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Killed | Status::Success | Status::Failed)
    }
}

/// A single entry in a state history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// The status entered
    pub status: Status,

    /// When the status was entered
    pub timestamp: DateTime<Utc>,
}

/// A current status plus the append-only history of every transition taken.
///
/// The history only ever grows; the current status is always its last entry.
/// `transition` returns a new value rather than mutating in place, so
/// snapshots holding an older `State` are never disturbed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    current: Status,
    history: Vec<StateTransition>,
}

impl State {
    /// Create a new state in `CREATED`
    pub fn new() -> Self {
        Self::of(Status::Created)
    }

    /// Create a new state with the given initial status
    pub fn of(status: Status) -> Self {
        Self {
            current: status,
            history: vec![StateTransition {
                status,
                timestamp: Utc::now(),
            }],
        }
    }

    /// The current status (the last history entry)
    pub fn current(&self) -> Status {
        self.current
    }

    /// The full transition history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Whether the current status is terminal
    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// A copy of this state with `status` appended to the history.
    ///
    /// Callers are responsible for transition legality; the history itself
    /// only ever moves forward.
    #[must_use]
    pub fn transition(&self, status: Status) -> State {
        let mut history = self.history.clone();
        history.push(StateTransition {
            status,
            timestamp: Utc::now(),
        });

        State {
            current: status,
            history,
        }
    }

    /// How many times the given status appears in the history
    pub fn count(&self, status: Status) -> usize {
        self.history.iter().filter(|t| t.status == status).count()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_created() {
        let state = State::new();

        assert_eq!(state.current(), Status::Created);
        assert_eq!(state.history().len(), 1);
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_transition_appends() {
        let state = State::new()
            .transition(Status::Running)
            .transition(Status::Success);

        assert_eq!(state.current(), Status::Success);
        assert!(state.is_terminal());

        let statuses: Vec<Status> = state.history().iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![Status::Created, Status::Running, Status::Success]
        );
    }

    #[test]
    fn test_history_timestamps_monotonic() {
        let state = State::new()
            .transition(Status::Running)
            .transition(Status::Failed);

        let history = state.history();
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::Success.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Killed.is_terminal());

        assert!(!Status::Created.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Paused.is_terminal());
        assert!(!Status::Restarted.is_terminal());
        assert!(!Status::Killing.is_terminal());
    }

    #[test]
    fn test_count_occurrences() {
        let state = State::new()
            .transition(Status::Running)
            .transition(Status::Killing)
            .transition(Status::Killed);

        assert_eq!(state.count(Status::Killing), 1);
        assert_eq!(state.count(Status::Killed), 1);
        assert_eq!(state.count(Status::Paused), 0);
    }

    #[test]
    fn test_serialization_round_trip() {
        let state = State::new().transition(Status::Running);

        let serialized = serde_json::to_string(&state).unwrap();
        assert!(serialized.contains("RUNNING"));

        let deserialized: State = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, state);
    }
}
