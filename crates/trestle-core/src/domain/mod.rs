//! Domain models for the Trestle engine.
//!
//! Everything here is a plain serde-serializable value: flows and their task
//! trees, executions with their flat task-run arenas, states with their
//! transition histories, and the worker-fleet record types exchanged over
//! the log substrate.

/// Execution snapshots, task runs and attempts
pub mod execution;

/// Flow definitions and the task-variant set
pub mod flow;

/// Status tags and state histories
pub mod state;

/// Worker-fleet record types
pub mod worker;
