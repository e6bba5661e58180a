//! Telemetry for the Reflow runtime
//!
//! Two layers: in-process counters kept by [`RuntimeTelemetry`] (readable
//! through [`RuntimeTelemetry::snapshot`]) and an optional [`MetricsSink`]
//! the counters are forwarded to.

use crate::config::TelemetryConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const PROCESSES_CREATED: &str = "reflow_processes_created_total";
pub const PROCESSES_DELETED: &str = "reflow_processes_deleted_total";
pub const TRANSITIONS_APPLIED: &str = "reflow_transitions_applied_total";
pub const TRANSITIONS_REJECTED: &str = "reflow_transitions_rejected_total";
pub const TASKS_SUCCEEDED: &str = "reflow_tasks_succeeded_total";
pub const TASKS_FAILED: &str = "reflow_tasks_failed_total";
pub const TASKS_RETRIED: &str = "reflow_tasks_retried_total";
pub const FLOWS_SUCCEEDED: &str = "reflow_flows_succeeded_total";
pub const FLOWS_FAILED: &str = "reflow_flows_failed_total";
pub const TRANSACTIONS_COMMITTED: &str = "reflow_transactions_committed_total";
pub const TRANSACTIONS_ROLLED_BACK: &str = "reflow_transactions_rolled_back_total";
pub const CACHE_HITS: &str = "reflow_cache_hits_total";
pub const CACHE_MISSES: &str = "reflow_cache_misses_total";

pub const TASK_DURATION_MS: &str = "reflow_task_duration_ms";
pub const FLOW_DURATION_MS: &str = "reflow_flow_duration_ms";
pub const CACHE_LOCAL_ENTRIES: &str = "reflow_cache_local_entries";

/// Destination for runtime metrics
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, value: u64);
    fn record_histogram(&self, name: &str, value: f64);
    fn record_gauge(&self, name: &str, value: f64);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment_counter(&self, _name: &str, _value: u64) {}
    fn record_histogram(&self, _name: &str, _value: f64) {}
    fn record_gauge(&self, _name: &str, _value: f64) {}
}

/// Forwards to the global `metrics` recorder
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetricsSink;

impl MetricsSink for RecorderMetricsSink {
    fn increment_counter(&self, name: &str, value: u64) {
        metrics::counter!(name.to_string(), value);
    }

    fn record_histogram(&self, name: &str, value: f64) {
        metrics::histogram!(name.to_string(), value);
    }

    fn record_gauge(&self, name: &str, value: f64) {
        metrics::gauge!(name.to_string(), value);
    }
}

/// Point-in-time copy of the runtime counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub counters: BTreeMap<String, u64>,
}

impl TelemetrySnapshot {
    /// Counter value, zero when never incremented
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Runtime telemetry system
pub struct RuntimeTelemetry {
    config: TelemetryConfig,
    sink: Arc<dyn MetricsSink>,
    counters: RwLock<HashMap<&'static str, u64>>,
}

impl RuntimeTelemetry {
    pub fn new(config: &TelemetryConfig, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            config: config.clone(),
            sink,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn increment(&self, counter: &'static str) {
        if !self.config.enabled {
            return;
        }
        *self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(counter)
            .or_insert(0) += 1;

        if self.config.metrics_enabled {
            self.sink.increment_counter(counter, 1);
        }
    }

    pub fn observe(&self, histogram: &'static str, value: f64) {
        if self.config.enabled && self.config.metrics_enabled {
            self.sink.record_histogram(histogram, value);
        }
    }

    pub fn gauge(&self, gauge: &'static str, value: f64) {
        if self.config.enabled && self.config.metrics_enabled {
            self.sink.record_gauge(gauge, value);
        }
    }

    pub fn task_finished(&self, succeeded: bool, duration_ms: u64) {
        self.increment(if succeeded { TASKS_SUCCEEDED } else { TASKS_FAILED });
        self.observe(TASK_DURATION_MS, duration_ms as f64);
    }

    pub fn flow_finished(&self, succeeded: bool, duration_ms: u64) {
        self.increment(if succeeded { FLOWS_SUCCEEDED } else { FLOWS_FAILED });
        self.observe(FLOW_DURATION_MS, duration_ms as f64);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        TelemetrySnapshot { counters }
    }

    pub fn flush(&self) {
        if !self.config.enabled {
            return;
        }
        let snapshot = self.snapshot();
        tracing::debug!(counters = ?snapshot.counters, "Flushing telemetry");
    }
}

impl std::fmt::Debug for RuntimeTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeTelemetry")
            .field("config", &self.config)
            .field("counters", &self.snapshot().counters)
            .finish_non_exhaustive()
    }
}

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Returns false when a global subscriber already exists.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
