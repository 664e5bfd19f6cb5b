//! Progress emitter that writes engine events to the tracing pipeline.
//!
//! Hosts without a UI stream can plug this into the engine to get one
//! structured log line per lifecycle event.

use opsflow_core::workflow::handler::ProgressEmitter;
use opsflow_types::event::EngineEvent;

/// Logs every [`EngineEvent`] under the `opsflow::progress` target.
///
/// Failures are logged at `warn`, everything else at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressEmitter;

impl ProgressEmitter for TracingProgressEmitter {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::StepFailed {
                run_id,
                node_id,
                error,
            } => {
                tracing::warn!(target: "opsflow::progress", run_id = %run_id, node_id = %node_id, error = %error, "step failed");
            }
            EngineEvent::RunFailed { run_id, error } => {
                tracing::warn!(target: "opsflow::progress", run_id = %run_id, error = %error, "run failed");
            }
            EngineEvent::CompensationFinished {
                run_id,
                total,
                succeeded,
                failed,
            } => {
                tracing::warn!(
                    target: "opsflow::progress",
                    run_id = %run_id,
                    total,
                    succeeded,
                    failed,
                    "compensation finished"
                );
            }
            other => {
                let payload = serde_json::to_string(other).unwrap_or_default();
                tracing::info!(
                    target: "opsflow::progress",
                    run_id = %other.run_id(),
                    node_id = other.node_id().unwrap_or(""),
                    event = %payload,
                    "progress"
                );
            }
        }
    }
}
