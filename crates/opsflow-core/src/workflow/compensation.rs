//! Saga compensation: register undo actions, run them newest first.

use serde_json::Value;

use opsflow_types::workflow::{CompensationResult, CompensationSummary};

use super::handler::ToolExecutor;

/// Undo action registered after its forward action succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationEntry {
    /// Node (or action) whose effect this entry undoes.
    pub node_id: String,
    /// Tool to invoke.
    pub action: String,
    pub args: Value,
}

/// Registered compensations for one action sequence or run.
#[derive(Debug, Clone, Default)]
pub struct CompensationPlan {
    entries: Vec<CompensationEntry>,
}

impl CompensationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    /// Entries in reverse registration order.
    pub fn entries(&self) -> impl Iterator<Item = &CompensationEntry> {
        self.entries.iter().rev()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Invoke every compensation in the given order.
///
/// A failing compensation is recorded and never stops the ones after it.
pub async fn run_compensations<'a, I>(entries: I, executor: &dyn ToolExecutor) -> CompensationSummary
where
    I: IntoIterator<Item = &'a CompensationEntry>,
{
    let mut results = Vec::new();

    for entry in entries {
        let outcome = executor.execute_tool(&entry.action, entry.args.clone()).await;
        let error = match outcome {
            Ok(_) => {
                tracing::debug!(node_id = %entry.node_id, action = %entry.action, "compensation succeeded");
                None
            }
            Err(e) => {
                tracing::warn!(
                    node_id = %entry.node_id,
                    action = %entry.action,
                    error = %e,
                    "compensation failed"
                );
                Some(e)
            }
        };
        results.push(CompensationResult {
            node_id: entry.node_id.clone(),
            compensate_action: entry.action.clone(),
            success: error.is_none(),
            error,
        });
    }

    let succeeded = results.iter().filter(|r| r.success).count();
    CompensationSummary {
        total: results.len(),
        succeeded,
        failed: results.len() - succeeded,
        results,
    }
}
