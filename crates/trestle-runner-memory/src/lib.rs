//!
//! Trestle Runner (in-memory) - runtime wiring for the Trestle core
//!
//! Realizes the log substrate the core is written against, entirely in
//! process: a single-writer event queue feeding the execution reducer, a
//! periodic wall-clock tick for the delay scheduler, channels exposing
//! dispatched worker tasks and execution updates, and re-injection of
//! trigger-created executions into the main queue. Useful for embedding
//! the engine in tests and single-node deployments.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// The runner and its embedded worker-pool harness
pub mod runner;

pub use runner::{MemoryRunner, TaskHandler};
