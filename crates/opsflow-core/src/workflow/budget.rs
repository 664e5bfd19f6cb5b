//! Resource budget for a single run.
//!
//! Graphs are user-authored, so every run is bounded in three ways: how many
//! nodes it may dispatch, how long it may take end to end, and how long any
//! single handler call (ai-step, loop iteration, parallel branch) may take.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use futures_util::future::{select, Either};

use opsflow_types::config::EngineConfig;
use opsflow_types::workflow::WorkflowSettings;

use super::clock::Clock;
use super::error::WorkflowError;

/// Step, duration and per-node limits plus the counters they apply to.
#[derive(Debug, Clone)]
pub struct RunBudget {
    pub max_steps: u32,
    pub max_duration_ms: u64,
    pub node_timeout_ms: u64,
    steps: u32,
    started_ms: u64,
}

impl RunBudget {
    /// Limits from the workflow settings, falling back to the engine config.
    /// Counting starts at `clock.now_ms()`.
    pub fn resolve(
        settings: Option<&WorkflowSettings>,
        config: &EngineConfig,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            max_steps: settings
                .and_then(|s| s.max_steps)
                .unwrap_or(config.max_steps),
            max_duration_ms: settings
                .and_then(|s| s.max_duration_ms)
                .unwrap_or(config.max_duration_ms),
            node_timeout_ms: settings
                .and_then(|s| s.node_timeout_ms)
                .unwrap_or(config.node_timeout_ms),
            steps: 0,
            started_ms: clock.now_ms(),
        }
    }

    /// Count one dispatch of `node_id`, failing if that would exceed a limit.
    ///
    /// Called before the node runs, so an over-budget node is never started.
    pub fn check_before_dispatch(
        &mut self,
        node_id: &str,
        clock: &dyn Clock,
    ) -> Result<(), WorkflowError> {
        self.steps += 1;
        if self.steps > self.max_steps {
            tracing::warn!(node_id, max_steps = self.max_steps, "step budget exhausted");
            return Err(WorkflowError::StepLimitExceeded {
                max: self.max_steps,
            });
        }

        let elapsed = clock.now_ms().saturating_sub(self.started_ms);
        if elapsed > self.max_duration_ms {
            tracing::warn!(
                node_id,
                elapsed_ms = elapsed,
                max_duration_ms = self.max_duration_ms,
                "duration budget exhausted"
            );
            return Err(WorkflowError::DurationExceeded {
                max_ms: self.max_duration_ms,
            });
        }

        Ok(())
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }
}

/// Race `fut` against a clock sleep of `duration`.
///
/// The loser is dropped; a timed-out operation's side effects are not undone.
pub async fn with_timeout<T, F>(
    clock: &dyn Clock,
    duration: Duration,
    what: &str,
    fut: F,
) -> Result<T, WorkflowError>
where
    F: Future<Output = T>,
{
    let fut = pin!(fut);
    match select(fut, clock.sleep(duration)).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(_) => Err(WorkflowError::Timeout {
            operation: what.to_string(),
            timeout_ms: duration.as_millis() as u64,
        }),
    }
}
