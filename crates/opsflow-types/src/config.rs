//! Engine configuration types for Opsflow.
//!
//! `EngineConfig` represents the `opsflow.toml` file that sets the engine-wide
//! resource budgets, loop limits, default retry policy and logging options.
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node dispatches per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Wall-clock ceiling for a run, measured from its start.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,

    /// Per-node timeout for ai-step calls, loop iterations and parallel branches.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Ceiling applied to every loop's `maxIterations`.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Retries for a single loop iteration handler call.
    #[serde(default = "default_loop_item_max_retries")]
    pub loop_item_max_retries: u32,

    /// Fixed delay between loop iteration retries.
    #[serde(default = "default_loop_item_backoff_ms")]
    pub loop_item_backoff_ms: u64,

    /// Roll back succeeded tool nodes that declare a compensation when a run fails.
    #[serde(default = "default_compensate_on_failure")]
    pub compensate_on_failure: bool,

    /// Retry policy for saga actions that declare none.
    #[serde(default)]
    pub default_retry: RetryPolicy,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_steps() -> u32 {
    100
}

fn default_max_duration_ms() -> u64 {
    300_000
}

fn default_node_timeout_ms() -> u64 {
    60_000
}

fn default_max_loop_iterations() -> u32 {
    1000
}

fn default_loop_item_max_retries() -> u32 {
    2
}

fn default_loop_item_backoff_ms() -> u64 {
    100
}

fn default_compensate_on_failure() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_duration_ms: default_max_duration_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            loop_item_max_retries: default_loop_item_max_retries(),
            loop_item_backoff_ms: default_loop_item_backoff_ms(),
            compensate_on_failure: default_compensate_on_failure(),
            default_retry: RetryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Tracing subscriber options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}
