//! Reflow runtime.
//!
//! [`ReflowRuntime`] wires the event bus, the process/task/flow engines,
//! the tiered cache and telemetry together and adds:
//! - memoized process lookups and task results
//! - snapshot [`Transaction`]s with commit and rollback
//! - save/restore of process instances through a [`StateStore`]
//!
//! ```no_run
//! use reflow_runtime::{config::RuntimeConfig, ReflowRuntime};
//!
//! let runtime = ReflowRuntime::bootstrap(RuntimeConfig::default()).unwrap();
//! runtime.shutdown();
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
mod runtime;
pub mod store;
pub mod telemetry;
mod transaction;

pub use runtime::{process_cache_key, task_result_key, ReflowRuntime, RuntimeBuilder};
pub use store::{InMemoryStateStore, StateStore};
pub use telemetry::{
    init_tracing, MetricsSink, NoopMetricsSink, RecorderMetricsSink, RuntimeTelemetry,
    TelemetrySnapshot,
};
pub use transaction::{OperationType, Transaction, TransactionOperation, TransactionState};

pub use reflow_cache as cache;
pub use reflow_engine as engine;
pub use reflow_types as types;
