//! Node dispatch for every workflow node kind.
//!
//! `StepRunner` matches on the closed [`NodeKind`] enum and runs the node
//! against the current [`WorkflowContext`]. It never mutates the context:
//! results come back as a [`StepOutcome`] and the run loop records them.
//! Loop and parallel nodes live in `control`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use opsflow_types::config::EngineConfig;
use opsflow_types::workflow::{
    AiStepConfig, ConditionConfig, NodeKind, RetryPolicy, ToolConfig, WorkflowDefinition,
    WorkflowNode,
};

use super::budget::{with_timeout, RunBudget};
use super::clock::Clock;
use super::context::WorkflowContext;
use super::dag::{predecessors, prune_branch};
use super::error::WorkflowError;
use super::expression::{resolve_path, safe_evaluate_expression};
use super::handler::{AiStepHandler, LoopIterationHandler, ParallelBranchHandler, ToolExecutor};
use super::retry::with_retry;
use super::schema::validate_output;

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What a dispatched node produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The node finished with a result.
    Completed(Value),
    /// A condition finished; `skipped` lists the nodes its unselected branch
    /// rules out, in dispatch order.
    Branched { output: Value, skipped: Vec<String> },
    /// An approval node halted the run.
    Suspended,
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Everything outside the engine that nodes call into.
#[derive(Clone)]
pub struct Collaborators {
    pub tools: Arc<dyn ToolExecutor>,
    pub ai: Option<Arc<dyn AiStepHandler>>,
    pub loop_handler: Arc<dyn LoopIterationHandler>,
    pub branch_handler: Arc<dyn ParallelBranchHandler>,
    pub clock: Arc<dyn Clock>,
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Runs individual nodes of one workflow run.
pub struct StepRunner<'a> {
    pub(super) collaborators: &'a Collaborators,
    pub(super) config: &'a EngineConfig,
    pub(super) definition: &'a WorkflowDefinition,
    pub(super) order: &'a [String],
    pub(super) budget: &'a RunBudget,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        collaborators: &'a Collaborators,
        config: &'a EngineConfig,
        definition: &'a WorkflowDefinition,
        order: &'a [String],
        budget: &'a RunBudget,
    ) -> Self {
        Self {
            collaborators,
            config,
            definition,
            order,
            budget,
        }
    }

    /// Run `node`. `skipped` is the set of nodes already ruled out.
    pub async fn run(
        &self,
        node: &WorkflowNode,
        ctx: &WorkflowContext,
        skipped: &HashSet<String>,
    ) -> Result<StepOutcome, WorkflowError> {
        match &node.kind {
            NodeKind::Input => Ok(StepOutcome::Completed(ctx.input().clone())),
            NodeKind::Tool(cfg) => self.run_tool(&node.id, cfg, ctx).await.map(StepOutcome::Completed),
            NodeKind::Condition(cfg) => self.run_condition(&node.id, cfg, ctx, skipped),
            NodeKind::Approval(cfg) => {
                tracing::info!(
                    node_id = %node.id,
                    approval_message = cfg.message.as_deref().unwrap_or(""),
                    "approval required, suspending"
                );
                Ok(StepOutcome::Suspended)
            }
            NodeKind::Output(cfg) => Ok(StepOutcome::Completed(Self::run_output(
                cfg.output_mapping.as_ref(),
                ctx,
            ))),
            NodeKind::AiStep(cfg) => self.run_ai_step(&node.id, cfg, ctx).await.map(StepOutcome::Completed),
            NodeKind::Loop(cfg) => self.run_loop(&node.id, cfg, ctx).await.map(StepOutcome::Completed),
            NodeKind::Parallel(cfg) => self
                .run_parallel(&node.id, cfg, ctx)
                .await
                .map(StepOutcome::Completed),
        }
    }

    pub(super) fn clock(&self) -> &dyn Clock {
        self.collaborators.clock.as_ref()
    }

    // -----------------------------------------------------------------------
    // Tool
    // -----------------------------------------------------------------------

    async fn run_tool(
        &self,
        node_id: &str,
        cfg: &ToolConfig,
        ctx: &WorkflowContext,
    ) -> Result<Value, WorkflowError> {
        if cfg.tool_name.trim().is_empty() {
            return Err(WorkflowError::missing_field(node_id, "toolName"));
        }

        let args = ctx.interpolate_value(&cfg.args);
        let workflow_retry = self
            .definition
            .settings
            .as_ref()
            .and_then(|s| s.default_retry.as_ref());
        let policy = match (cfg.retry.as_ref(), workflow_retry) {
            (None, None) => RetryPolicy::none(),
            (action, workflow) => RetryPolicy::resolve(action, workflow),
        };

        let tools = self.collaborators.tools.as_ref();
        let outcome = with_retry(&policy, self.clock(), |_| {
            tools.execute_tool(&cfg.tool_name, args.clone())
        })
        .await;

        match outcome {
            Ok(done) => {
                tracing::debug!(node_id, tool = %cfg.tool_name, attempts = done.attempts, "tool succeeded");
                Ok(done.value)
            }
            Err(exhausted) => Err(WorkflowError::Tool {
                tool: cfg.tool_name.clone(),
                message: if exhausted.attempts > 1 {
                    format!("{} (after {} attempts)", exhausted.error, exhausted.attempts)
                } else {
                    exhausted.error
                },
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Condition
    // -----------------------------------------------------------------------

    fn run_condition(
        &self,
        node_id: &str,
        cfg: &ConditionConfig,
        ctx: &WorkflowContext,
        skipped: &HashSet<String>,
    ) -> Result<StepOutcome, WorkflowError> {
        if cfg.expression.trim().is_empty() {
            return Err(WorkflowError::missing_field(node_id, "expression"));
        }

        let predecessor = predecessors(node_id, &self.definition.edges)
            .first()
            .and_then(|p| ctx.step_result(p));
        let scope = ctx.condition_scope(predecessor);
        let result = safe_evaluate_expression(&cfg.expression, &scope);

        let (selected, unselected) = if result {
            (cfg.true_branch.as_deref(), cfg.false_branch.as_deref())
        } else {
            (cfg.false_branch.as_deref(), cfg.true_branch.as_deref())
        };

        let pruned = match unselected {
            Some(root) => {
                if self.definition.node(root).is_none() {
                    return Err(WorkflowError::UnknownNode(format!(
                        "condition '{node_id}' branches to unknown node '{root}'"
                    )));
                }
                prune_branch(root, self.order, &self.definition.edges, skipped)
                    .into_iter()
                    .filter(|id| ctx.step_result(id).is_none() && !skipped.contains(id))
                    .collect()
            }
            None => Vec::new(),
        };

        tracing::debug!(
            node_id,
            result,
            selected = selected.unwrap_or(""),
            pruned = pruned.len(),
            "condition evaluated"
        );

        Ok(StepOutcome::Branched {
            output: json!({
                "result": result,
                "expression": cfg.expression,
                "selectedBranch": selected,
                "skipped": pruned,
            }),
            skipped: pruned,
        })
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    fn run_output(mapping: Option<&BTreeMap<String, String>>, ctx: &WorkflowContext) -> Value {
        let results = Value::Object(ctx.step_results().clone());
        let Some(mapping) = mapping else {
            return results;
        };

        let mapped: Map<String, Value> = mapping
            .iter()
            .map(|(key, path)| {
                let value = resolve_path(&results, path)
                    .map(|v| v.into_owned())
                    .unwrap_or(Value::Null);
                (key.clone(), value)
            })
            .collect();
        Value::Object(mapped)
    }

    // -----------------------------------------------------------------------
    // AI step
    // -----------------------------------------------------------------------

    async fn run_ai_step(
        &self,
        node_id: &str,
        cfg: &AiStepConfig,
        ctx: &WorkflowContext,
    ) -> Result<Value, WorkflowError> {
        if cfg.prompt.trim().is_empty() {
            return Err(WorkflowError::missing_field(node_id, "prompt"));
        }
        let Some(handler) = self.collaborators.ai.as_ref() else {
            return Err(WorkflowError::HandlerNotConfigured("ai-step".to_string()));
        };

        let payload = json!({
            "prompt": ctx.interpolate(&cfg.prompt),
            "systemPrompt": cfg.system_prompt.as_deref().map(|s| ctx.interpolate(s)),
            "model": cfg.model,
            "input": ctx.input(),
        });

        let what = format!("ai-step '{node_id}'");
        let result = with_timeout(
            self.clock(),
            self.budget.node_timeout(),
            &what,
            handler.handle(payload),
        )
        .await?
        .map_err(|e| WorkflowError::Handler(format!("{what}: {e}")))?;

        if let Some(schema) = &cfg.output_schema {
            validate_output(&result, schema)?;
        }
        Ok(result)
    }
}
