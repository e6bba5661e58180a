//! Reflow engines.
//!
//! - [`EventBus`]: synchronous, ordered pub/sub with a `*` wildcard
//! - [`ProcessEngine`]: state machines over an injected [`InstanceRepository`]
//! - [`TaskManager`]: validated, time-limited, retried task execution
//! - [`FlowEngine`]: linked walks of task/condition/parallel/wait steps
//!
//! The engines share one bus and report their lifecycle on it using the
//! event types in [`reflow_types::events`].

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod event_bus;
pub mod flow;
pub mod process;
pub mod repository;
pub mod task;

pub use event_bus::{EventBus, EventBusStats, HandlerFailure, HandlerResult, Subscription};
pub use flow::{FlowEngine, FlowOptions, FlowResult, StepStatus, TraceEntry};
pub use process::{
    CreateOptions, ProcessEngine, ProcessHooks, TransitionOutcome, TransitionResult,
};
pub use repository::InstanceRepository;
pub use task::{ExecuteOptions, TaskInvocation, TaskManager, TaskMiddleware};
