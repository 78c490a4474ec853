//! Execution engine for the Flow workflow graph.
//!
//! This crate provides the durable value store, the graph model, the serial
//! executor, and the breadth-first batch runner. Processor kinds plug in
//! through the traits in `flow-core`.

mod batch;
mod executor;
mod graph;
mod store;

pub use batch::{BatchFailure, BatchOptions, BatchReport, BatchRunner, ReleasePolicy};
pub use executor::Executor;
pub use graph::{Binding, Graph};
pub use store::{EntryMeta, StoredEntry, ValueStore};
