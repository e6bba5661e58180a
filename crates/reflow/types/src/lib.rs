//! Reflow Domain Types
//!
//! Reflow is a reactive workflow runtime. Everything it does is expressed
//! through a handful of value types that live in this crate so that the
//! engine, the cache layer and the runtime can share them without
//! depending on each other.
//!
//! # Key Concepts
//!
//! - **Event**: a typed, timestamped notification published on the bus.
//! - **ProcessDefinition**: a named state machine (states + transitions).
//! - **ProcessInstance**: a running, stateful execution of a definition.
//! - **TaskDefinition**: a unit of work with input/output schemas, a
//!   timeout and a [`RetryPolicy`].
//! - **Flow**: a linked walk of task/condition/parallel/wait steps.
//! - **ValuePath**: a typed lens into a flow's `input`, `variables` or
//!   `output` used by step input/output bindings.
//!
//! # Error Model
//!
//! Every fallible operation returns [`ReflowResult`]. Each
//! [`ReflowError`] variant maps onto exactly one [`ErrorKind`], which is
//! the stable, serializable classification callers match on.

#![deny(unsafe_code)]

mod errors;
pub mod events;
mod event;
mod flow;
mod ids;
mod instance;
mod path;
mod process;
mod retry;
mod schema;
mod task;

pub use errors::*;
pub use event::*;
pub use flow::*;
pub use ids::*;
pub use instance::*;
pub use path::*;
pub use process::*;
pub use retry::*;
pub use schema::*;
pub use task::*;

/// Process and flow context: a JSON object
pub type Context = serde_json::Map<String, serde_json::Value>;
