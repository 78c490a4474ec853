//! General-purpose processor kinds.
//!
//! A small library of kinds in the shape collaborators are expected to
//! follow: a unit struct implementing [`flow_core::ProcessorKind`] paired
//! with a private processor struct holding any per-instance state.

mod arithmetic;
mod debug;
mod transform;

pub use arithmetic::{Increment, Sum};
pub use debug::Log;
pub use transform::{JsonParse, JsonStringify};
