//! Core abstractions for the Flow engine.
//!
//! This crate provides the fundamental types and traits that the runtime
//! and processor-kind libraries depend on: the dynamic [`Value`] carrier,
//! declared input [`Signature`]s, the [`Processor`]/[`ProcessorKind`]
//! traits, structural [`Fingerprint`]s, the error taxonomy, and the
//! execution event bus.

mod error;
mod events;
pub mod fingerprint;
mod kind;
mod schema;
mod value;

pub use error::{
    ConstructionError, FlowError, NodeFailure, ProcessError, ResourceFailure, ResourcePhase,
    Result, StoreError,
};
pub use events::{EventBus, ExecutionEvent, RunId};
pub use fingerprint::{Fingerprint, InputDigest};
pub use kind::{Inputs, NodeId, Processor, ProcessorKind};
pub use schema::{Param, Signature, ValueType};
pub use value::Value;
