//! Collaborator contracts the engine calls out to.
//!
//! Every trait is object safe (boxed futures) so the engine can hold them as
//! `Arc<dyn ...>` and hosts can swap implementations at runtime. Failures are
//! plain messages; the engine wraps them into [`WorkflowError`] variants.
//!
//! [`WorkflowError`]: super::error::WorkflowError

use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use opsflow_types::event::EngineEvent;

use super::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Tool executor
// ---------------------------------------------------------------------------

/// Executes named tools. Used by tool nodes, saga actions and compensations.
pub trait ToolExecutor: Send + Sync {
    fn execute_tool<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<Value, String>>;
}

// ---------------------------------------------------------------------------
// AI step handler
// ---------------------------------------------------------------------------

/// Handles `ai-step` nodes.
///
/// The payload carries `prompt` (interpolated), `systemPrompt`, `model` and
/// the raw run `input`.
pub trait AiStepHandler: Send + Sync {
    fn handle(&self, payload: Value) -> BoxFuture<'_, Result<Value, String>>;
}

// ---------------------------------------------------------------------------
// Loop iteration handler
// ---------------------------------------------------------------------------

/// Runs one iteration of a loop node.
///
/// `scope` is the iteration scope: `{<item var>, <index var>, input,
/// ...stepResults}`.
pub trait LoopIterationHandler: Send + Sync {
    fn run_iteration(
        &self,
        item: Value,
        index: usize,
        scope: Value,
    ) -> BoxFuture<'_, Result<Value, String>>;
}

/// Default iteration handler: the iteration result is the item itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughIteration;

impl LoopIterationHandler for PassThroughIteration {
    fn run_iteration(
        &self,
        item: Value,
        _index: usize,
        _scope: Value,
    ) -> BoxFuture<'_, Result<Value, String>> {
        Box::pin(async move { Ok(item) })
    }
}

// ---------------------------------------------------------------------------
// Parallel branch handler
// ---------------------------------------------------------------------------

/// Runs one branch of a parallel node.
pub trait ParallelBranchHandler: Send + Sync {
    fn run_branch<'a>(
        &'a self,
        branch_id: &'a str,
        ctx: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<Value, String>>;
}

/// Default branch handler.
///
/// Returns the branch node's recorded step result when there is one, else
/// `{branch, input}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughBranch;

impl ParallelBranchHandler for PassThroughBranch {
    fn run_branch<'a>(
        &'a self,
        branch_id: &'a str,
        ctx: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<Value, String>> {
        Box::pin(async move {
            Ok(match ctx.step_result(branch_id) {
                Some(result) => result.clone(),
                None => json!({ "branch": branch_id, "input": ctx.input() }),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Progress emitter
// ---------------------------------------------------------------------------

/// Receives run and step lifecycle events. Observational only.
pub trait ProgressEmitter: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Emitter that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmitter;

impl ProgressEmitter for NoopEmitter {
    fn emit(&self, _event: EngineEvent) {}
}
