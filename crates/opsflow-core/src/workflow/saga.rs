//! Saga runner: an ordered action sequence with retries and rollback.
//!
//! Actions run strictly in declared order, each under its resolved retry
//! policy. The first action that exhausts its retries stops the sequence and
//! every compensation registered so far runs immediately, newest first. The
//! runner never returns an error: callers inspect the per-action outcomes and
//! the compensation summary.

use serde::Serialize;
use serde_json::Value;

use opsflow_types::workflow::{CompensateConfig, CompensationSummary, RetryPolicy};

use super::clock::Clock;
use super::compensation::{run_compensations, CompensationEntry, CompensationPlan};
use super::handler::ToolExecutor;
use super::retry::with_retry;

/// One forward action in a sequence.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub node_id: String,
    pub tool_name: String,
    pub args: Value,
    /// Overrides the workflow default retry.
    pub retry: Option<RetryPolicy>,
    /// Undo action registered once this action succeeds.
    pub compensate: Option<CompensateConfig>,
}

impl ActionSpec {
    pub fn new(node_id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            node_id: node_id.into(),
            tool_name: tool_name.into(),
            args,
            retry: None,
            compensate: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_compensation(mut self, action: impl Into<String>, args: Value) -> Self {
        self.compensate = Some(CompensateConfig {
            action: action.into(),
            args,
        });
        self
    }
}

/// What happened to a single action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub node_id: String,
    pub tool_name: String,
    pub success: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a whole sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceOutcome {
    pub actions: Vec<ActionOutcome>,
    /// Present when a failure triggered rollback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSummary>,
    pub success: bool,
}

/// Run `actions` in order, rolling back on the first terminal failure.
pub async fn run_action_sequence(
    actions: &[ActionSpec],
    executor: &dyn ToolExecutor,
    workflow_retry: Option<&RetryPolicy>,
    clock: &dyn Clock,
) -> SequenceOutcome {
    let mut plan = CompensationPlan::new();
    let mut outcomes = Vec::with_capacity(actions.len());

    for action in actions {
        let policy = RetryPolicy::resolve(action.retry.as_ref(), workflow_retry);
        let attempt = with_retry(&policy, clock, |_| {
            executor.execute_tool(&action.tool_name, action.args.clone())
        })
        .await;

        match attempt {
            Ok(done) => {
                tracing::debug!(
                    node_id = %action.node_id,
                    tool = %action.tool_name,
                    attempts = done.attempts,
                    "action succeeded"
                );
                if let Some(compensate) = &action.compensate {
                    plan.add(CompensationEntry {
                        node_id: action.node_id.clone(),
                        action: compensate.action.clone(),
                        args: compensate.args.clone(),
                    });
                }
                outcomes.push(ActionOutcome {
                    node_id: action.node_id.clone(),
                    tool_name: action.tool_name.clone(),
                    success: true,
                    attempts: done.attempts,
                    result: Some(done.value),
                    error: None,
                });
            }
            Err(exhausted) => {
                tracing::warn!(
                    node_id = %action.node_id,
                    tool = %action.tool_name,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    registered = plan.len(),
                    "action failed, rolling back"
                );
                outcomes.push(ActionOutcome {
                    node_id: action.node_id.clone(),
                    tool_name: action.tool_name.clone(),
                    success: false,
                    attempts: exhausted.attempts,
                    result: None,
                    error: Some(exhausted.error),
                });
                let summary = run_compensations(plan.entries(), executor).await;
                return SequenceOutcome {
                    actions: outcomes,
                    compensation: Some(summary),
                    success: false,
                };
            }
        }
    }

    plan.clear();
    SequenceOutcome {
        actions: outcomes,
        compensation: None,
        success: true,
    }
}
