//! Configuration for the Reflow runtime

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub tasks: TaskConfig,

    #[serde(default)]
    pub flows: FlowConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries kept in the local LRU tier
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,

    /// TTL applied to distributed writes; `None` keeps entries forever
    #[serde(default = "default_distributed_ttl")]
    pub distributed_ttl_secs: Option<u64>,

    /// Memoize `get_process` lookups
    #[serde(default = "default_true")]
    pub cache_process_lookups: bool,

    /// Memoize results of tasks marked `cache_results`
    #[serde(default = "default_true")]
    pub cache_task_results: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: default_local_capacity(),
            distributed_ttl_secs: default_distributed_ttl(),
            cache_process_lookups: true,
            cache_task_results: true,
        }
    }
}

impl CacheConfig {
    pub fn distributed_ttl(&self) -> Option<Duration> {
        self.distributed_ttl_secs.map(Duration::from_secs)
    }
}

/// Task manager configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Applied when neither the call nor the definition sets a timeout
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl TaskConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Flow engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_flow_timeout")]
    pub default_timeout_ms: u64,

    #[serde(default)]
    pub trace_by_default: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_flow_timeout(),
            trace_by_default: false,
        }
    }
}

impl FlowConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Keep in-process counters
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Forward counters to the metrics sink
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log every bus event at debug level
    #[serde(default)]
    pub log_events: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_enabled: true,
            log_events: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_local_capacity() -> usize {
    1000
}

fn default_distributed_ttl() -> Option<u64> {
    Some(300)
}

fn default_flow_timeout() -> u64 {
    30_000
}

impl RuntimeConfig {
    /// Load configuration: defaults, then an optional file, then
    /// `REFLOW_`-prefixed environment variables
    /// (e.g. `REFLOW_CACHE__LOCAL_CAPACITY=50`)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&RuntimeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("REFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Small cache, short flow timeout, no metrics forwarding
    pub fn testing() -> Self {
        Self {
            cache: CacheConfig {
                local_capacity: 64,
                ..Default::default()
            },
            tasks: TaskConfig::default(),
            flows: FlowConfig {
                default_timeout_ms: 5_000,
                trace_by_default: true,
            },
            telemetry: TelemetryConfig {
                metrics_enabled: false,
                ..Default::default()
            },
        }
    }
}
