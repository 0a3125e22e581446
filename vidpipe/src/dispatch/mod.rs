//! Task dispatch adapter.
//!
//! Translates a run into a dependency graph of units and hands them to an
//! external task queue through the [`ExecutionSubstrate`] interface. No
//! broker wire format is assumed; [`LocalSubstrate`] runs units on tokio.

mod dispatcher;
mod graph;
mod substrate;
mod types;

pub use dispatcher::{DispatchedRun, Dispatcher};
pub use graph::{TaskGraph, TaskUnit, UnitKind};
pub use substrate::{ExecutionSubstrate, LocalSubstrate, TaskHandle, TaskStatus, UnitExecutor};
pub use types::{Priority, QueueName, TaskRetryPolicy};
