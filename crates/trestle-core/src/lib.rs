//!
//! Trestle Core - the execution state machine of the Trestle orchestrator
//!
//! This crate holds the domain model (flows, executions, task runs, worker
//! records) and the services that drive them: the flow directory, the
//! execution reducer with its delay scheduler, the worker fleet tracker and
//! the flow trigger aggregator. It performs no I/O of its own; a runtime
//! harness (such as `trestle-runner-memory`) feeds it events and routes the
//! effects it produces.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flows, executions, task runs, states and worker records
pub mod domain;

/// Application services - directory, reducer, fleet tracker, aggregator
pub mod application;

/// Error types
pub mod error;

// Re-export the main API types for easy use
pub use error::CoreError;

pub use domain::execution::{Attempt, Execution, ExecutionKilled, TaskRun};
pub use domain::flow::{Flow, FlowRef, FlowTrigger, Task, TaskKind};
pub use domain::state::{State, StateTransition, Status};
pub use domain::worker::{
    RunContext, WorkerInstance, WorkerTask, WorkerTaskResult, WorkerTaskRunning,
};

pub use application::directory::FlowDirectory;
pub use application::fleet::{FleetEffect, FleetEvent, FleetTracker};
pub use application::reducer::{Effect, ExecutionReducer, ExecutorEvent};
pub use application::trigger::{TriggerAggregator, TriggerEvent};
