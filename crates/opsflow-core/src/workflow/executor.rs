//! Workflow engine: validated, budgeted, strictly ordered DAG execution.
//!
//! `WorkflowEngine` runs a definition's nodes one at a time in cached
//! topological order. Concurrency exists only inside loop and parallel nodes.
//! A run ends in one of three ways:
//!
//! 1. **Completed**: every node was dispatched or skipped.
//! 2. **Failed**: a node failed (fail-fast). Succeeded tool nodes that
//!    declare a compensation are rolled back newest first.
//! 3. **Suspended**: an approval node was reached. The returned
//!    [`EngineState`] is handed back to [`WorkflowEngine::resume`] once the
//!    approval is granted.
//!
//! Only a cyclic graph is returned as `Err`, before any node runs. Every
//! other problem, structural ones included (duplicate ids, unknown edge
//! endpoints, a checkpoint that does not match the definition), becomes a
//! failed [`ExecutionResult`].

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use opsflow_types::config::EngineConfig;
use opsflow_types::event::EngineEvent;
use opsflow_types::workflow::{
    EngineState, ExecutionResult, ExecutionStatus, NodeKind, NodeType, StepResults,
    WorkflowDefinition,
};

use super::budget::RunBudget;
use super::clock::{Clock, TokioClock};
use super::compensation::{run_compensations, CompensationEntry, CompensationPlan};
use super::context::WorkflowContext;
use super::dag::{topological_sort, validate_structure};
use super::error::WorkflowError;
use super::handler::{
    AiStepHandler, LoopIterationHandler, NoopEmitter, ParallelBranchHandler, PassThroughBranch,
    PassThroughIteration, ProgressEmitter, ToolExecutor,
};
use super::saga::{run_action_sequence, ActionSpec, SequenceOutcome};
use super::step_runner::{Collaborators, StepOutcome, StepRunner};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`WorkflowEngine`]. Only the tool executor is required.
pub struct WorkflowEngineBuilder {
    tools: Arc<dyn ToolExecutor>,
    ai: Option<Arc<dyn AiStepHandler>>,
    loop_handler: Arc<dyn LoopIterationHandler>,
    branch_handler: Arc<dyn ParallelBranchHandler>,
    emitter: Arc<dyn ProgressEmitter>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl WorkflowEngineBuilder {
    pub fn ai_handler(mut self, handler: Arc<dyn AiStepHandler>) -> Self {
        self.ai = Some(handler);
        self
    }

    pub fn loop_handler(mut self, handler: Arc<dyn LoopIterationHandler>) -> Self {
        self.loop_handler = handler;
        self
    }

    pub fn branch_handler(mut self, handler: Arc<dyn ParallelBranchHandler>) -> Self {
        self.branch_handler = handler;
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn ProgressEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        WorkflowEngine {
            collaborators: Collaborators {
                tools: self.tools,
                ai: self.ai,
                loop_handler: self.loop_handler,
                branch_handler: self.branch_handler,
                clock: self.clock,
            },
            emitter: self.emitter,
            config: self.config,
            order_cache: DashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Node ids and edge endpoints in declaration order. A cached order is only
/// reused while the definition still has this exact shape.
#[derive(Debug, PartialEq, Eq)]
struct GraphShape {
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
}

impl GraphShape {
    fn of(definition: &WorkflowDefinition) -> Self {
        Self {
            nodes: definition.nodes.iter().map(|n| n.id.clone()).collect(),
            edges: definition
                .edges
                .iter()
                .map(|e| (e.source.clone(), e.target.clone()))
                .collect(),
        }
    }
}

struct CachedOrder {
    shape: GraphShape,
    order: Arc<Vec<String>>,
}

/// Where a run starts: fresh, or from a checkpoint.
struct RunStart {
    run_id: Uuid,
    ctx: WorkflowContext,
    completed: Vec<String>,
    skipped: HashSet<String>,
    resumed: bool,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflow definitions against injected collaborators.
pub struct WorkflowEngine {
    collaborators: Collaborators,
    emitter: Arc<dyn ProgressEmitter>,
    config: EngineConfig,
    /// Topological order keyed by `id@version`.
    order_cache: DashMap<String, CachedOrder>,
}

impl WorkflowEngine {
    pub fn builder(tools: Arc<dyn ToolExecutor>) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            tools,
            ai: None,
            loop_handler: Arc::new(PassThroughIteration),
            branch_handler: Arc::new(PassThroughBranch),
            emitter: Arc::new(NoopEmitter),
            clock: Arc::new(TokioClock::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of definitions whose order is cached.
    pub fn cached_orders(&self) -> usize {
        self.order_cache.len()
    }

    /// Run a saga action sequence with this engine's tool executor and
    /// clock. Actions without a retry policy use the engine default.
    pub async fn run_actions(&self, actions: &[ActionSpec]) -> SequenceOutcome {
        run_action_sequence(
            actions,
            self.collaborators.tools.as_ref(),
            Some(&self.config.default_retry),
            self.collaborators.clock.as_ref(),
        )
        .await
    }

    /// Run a definition from the start. Fails with `Err` only for a cyclic
    /// graph.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<ExecutionResult, WorkflowError> {
        self.execute_with_cancellation(definition, input, CancellationToken::new())
            .await
    }

    /// Run a definition from the start; `token` cancels the run between (or
    /// during) node dispatches.
    pub async fn execute_with_cancellation(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
        token: CancellationToken,
    ) -> Result<ExecutionResult, WorkflowError> {
        let run_id = Uuid::now_v7();
        let order = match self.execution_order(definition) {
            Ok(order) => order,
            Err(e @ WorkflowError::CycleDetected(_)) => return Err(e),
            Err(e) => return Ok(self.reject(run_id, e, StepResults::new())),
        };
        let start = RunStart {
            run_id,
            ctx: WorkflowContext::new(input),
            completed: Vec::new(),
            skipped: HashSet::new(),
            resumed: false,
        };
        Ok(self.drive(definition, &order, start, &token).await)
    }

    /// Continue a suspended run after its approval was granted.
    ///
    /// Nodes in `completedNodeIds`, `skippedNodeIds` and the approval node
    /// itself are never dispatched again.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        engine_state: EngineState,
        input: Value,
    ) -> Result<ExecutionResult, WorkflowError> {
        let order = match self.execution_order(definition) {
            Ok(order) => order,
            Err(e @ WorkflowError::CycleDetected(_)) => return Err(e),
            Err(e) => {
                return Ok(self.reject(engine_state.run_id, e, engine_state.step_results));
            }
        };

        let approved = &engine_state.suspended_at_node_id;
        let mismatch = match definition.node(approved).map(|n| n.node_type()) {
            Some(NodeType::Approval) => None,
            Some(other) => Some(WorkflowError::Validation(format!(
                "checkpoint suspended at '{approved}', which is a {other} node, not an approval"
            ))),
            None => Some(WorkflowError::UnknownNode(format!(
                "checkpoint suspended at unknown node '{approved}'"
            ))),
        };
        if let Some(e) = mismatch {
            return Ok(self.reject(engine_state.run_id, e, engine_state.step_results));
        }

        let EngineState {
            run_id,
            suspended_at_node_id,
            mut completed_node_ids,
            skipped_node_ids,
            step_results,
        } = engine_state;
        completed_node_ids.push(suspended_at_node_id);

        let start = RunStart {
            run_id,
            ctx: WorkflowContext::restore(input, step_results),
            completed: completed_node_ids,
            skipped: skipped_node_ids.into_iter().collect(),
            resumed: true,
        };
        Ok(self
            .drive(definition, &order, start, &CancellationToken::new())
            .await)
    }

    /// Validated topological order.
    ///
    /// Structure is checked on every call. The sort itself is cached per
    /// `id@version` and recomputed when the graph under that key changed.
    fn execution_order(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Arc<Vec<String>>, WorkflowError> {
        validate_structure(definition)?;

        let key = definition.cache_key();
        let shape = GraphShape::of(definition);
        if let Some(cached) = self.order_cache.get(&key) {
            if cached.shape == shape {
                return Ok(Arc::clone(&cached.order));
            }
            tracing::debug!(workflow = %key, "graph changed without a version bump, re-sorting");
        }

        let order = Arc::new(topological_sort(&definition.nodes, &definition.edges)?);
        self.order_cache.insert(
            key,
            CachedOrder {
                shape,
                order: Arc::clone(&order),
            },
        );
        Ok(order)
    }

    /// A run that never started because the definition or checkpoint is
    /// unusable.
    fn reject(
        &self,
        run_id: Uuid,
        error: WorkflowError,
        step_results: StepResults,
    ) -> ExecutionResult {
        let message = error.to_string();
        tracing::warn!(run_id = %run_id, error = %message, "workflow rejected before dispatch");
        self.emitter.emit(EngineEvent::RunFailed {
            run_id,
            error: message.clone(),
        });

        ExecutionResult {
            run_id,
            status: ExecutionStatus::Failed,
            step_results,
            output: None,
            error: Some(message),
            engine_state: None,
            compensation: None,
        }
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        order: &[String],
        start: RunStart,
        token: &CancellationToken,
    ) -> ExecutionResult {
        let span = tracing::info_span!(
            "workflow.run",
            run_id = %start.run_id,
            workflow = %definition.name,
            version = %definition.version,
        );
        self.run_nodes(definition, order, start, token)
            .instrument(span)
            .await
    }

    async fn run_nodes(
        &self,
        definition: &WorkflowDefinition,
        order: &[String],
        start: RunStart,
        token: &CancellationToken,
    ) -> ExecutionResult {
        let RunStart {
            run_id,
            mut ctx,
            mut completed,
            mut skipped,
            resumed,
        } = start;
        let clock = self.collaborators.clock.as_ref();
        let run_started = clock.now_ms();
        let mut budget = RunBudget::resolve(definition.settings.as_ref(), &self.config, clock);
        let mut plan = CompensationPlan::new();
        let mut output = None;
        let done: HashSet<String> = completed.iter().cloned().collect();

        tracing::info!(
            nodes = definition.nodes.len(),
            resumed,
            "starting workflow execution"
        );
        self.emitter.emit(EngineEvent::RunStarted {
            run_id,
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            resumed,
        });

        for node_id in order {
            if done.contains(node_id) || skipped.contains(node_id) {
                continue;
            }

            let dispatched = if token.is_cancelled() {
                Err(WorkflowError::Cancelled)
            } else {
                budget.check_before_dispatch(node_id, clock)
            };
            if let Err(e) = dispatched {
                return self.fail(run_id, node_id, e, ctx, &plan).await;
            }

            let Some(node) = definition.node(node_id) else {
                let e = WorkflowError::UnknownNode(node_id.clone());
                return self.fail(run_id, node_id, e, ctx, &plan).await;
            };

            tracing::debug!(node_id = %node_id, node_type = %node.node_type(), "dispatching node");
            self.emitter.emit(EngineEvent::StepStarted {
                run_id,
                node_id: node_id.clone(),
                node_type: node.node_type().to_string(),
            });
            let step_started = clock.now_ms();

            let runner = StepRunner::new(&self.collaborators, &self.config, definition, order, &budget);
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(WorkflowError::Cancelled),
                outcome = runner.run(node, &ctx, &skipped) => outcome,
            };

            match outcome {
                Ok(StepOutcome::Completed(result)) => {
                    if node.node_type() == NodeType::Output {
                        output = Some(result.clone());
                    }
                    ctx.record(node_id, result);
                    if let NodeKind::Tool(tool) = &node.kind {
                        if let Some(compensate) = &tool.compensate {
                            plan.add(CompensationEntry {
                                node_id: node_id.clone(),
                                action: compensate.action.clone(),
                                args: ctx.interpolate_value(&compensate.args),
                            });
                        }
                    }
                }
                Ok(StepOutcome::Branched {
                    output: result,
                    skipped: pruned,
                }) => {
                    ctx.record(node_id, result);
                    for id in pruned {
                        tracing::debug!(node_id = %id, condition = %node_id, "node skipped");
                        self.emitter.emit(EngineEvent::StepSkipped {
                            run_id,
                            node_id: id.clone(),
                        });
                        skipped.insert(id);
                    }
                }
                Ok(StepOutcome::Suspended) => {
                    return self.suspend(run_id, node_id, order, completed, &skipped, ctx);
                }
                Err(e) => {
                    return self.fail(run_id, node_id, e, ctx, &plan).await;
                }
            }

            completed.push(node_id.clone());
            self.emitter.emit(EngineEvent::StepCompleted {
                run_id,
                node_id: node_id.clone(),
                duration_ms: clock.now_ms().saturating_sub(step_started),
            });
        }

        plan.clear();
        let duration_ms = clock.now_ms().saturating_sub(run_started);
        tracing::info!(
            steps = budget.steps(),
            skipped = skipped.len(),
            duration_ms,
            "workflow completed"
        );
        self.emitter.emit(EngineEvent::RunCompleted {
            run_id,
            duration_ms,
            steps_completed: budget.steps(),
        });

        ExecutionResult {
            run_id,
            status: ExecutionStatus::Completed,
            step_results: ctx.into_step_results(),
            output,
            error: None,
            engine_state: None,
            compensation: None,
        }
    }

    fn suspend(
        &self,
        run_id: Uuid,
        node_id: &str,
        order: &[String],
        completed: Vec<String>,
        skipped: &HashSet<String>,
        ctx: WorkflowContext,
    ) -> ExecutionResult {
        tracing::info!(node_id, completed = completed.len(), "workflow suspended for approval");
        self.emitter.emit(EngineEvent::RunSuspended {
            run_id,
            node_id: node_id.to_string(),
        });

        let step_results = ctx.into_step_results();
        let engine_state = EngineState {
            run_id,
            suspended_at_node_id: node_id.to_string(),
            completed_node_ids: completed,
            skipped_node_ids: order
                .iter()
                .filter(|id| skipped.contains(*id))
                .cloned()
                .collect(),
            step_results: step_results.clone(),
        };

        ExecutionResult {
            run_id,
            status: ExecutionStatus::Suspended,
            step_results,
            output: None,
            error: None,
            engine_state: Some(engine_state),
            compensation: None,
        }
    }

    async fn fail(
        &self,
        run_id: Uuid,
        node_id: &str,
        error: WorkflowError,
        ctx: WorkflowContext,
        plan: &CompensationPlan,
    ) -> ExecutionResult {
        let message = format!("node '{node_id}': {error}");
        tracing::warn!(node_id, error = %error, "workflow failed");
        self.emitter.emit(EngineEvent::StepFailed {
            run_id,
            node_id: node_id.to_string(),
            error: error.to_string(),
        });

        let compensation = if self.config.compensate_on_failure && !plan.is_empty() {
            tracing::info!(entries = plan.len(), "rolling back completed tool nodes");
            let summary = run_compensations(plan.entries(), self.collaborators.tools.as_ref()).await;
            self.emitter.emit(EngineEvent::CompensationFinished {
                run_id,
                total: summary.total,
                succeeded: summary.succeeded,
                failed: summary.failed,
            });
            Some(summary)
        } else {
            None
        };

        self.emitter.emit(EngineEvent::RunFailed {
            run_id,
            error: message.clone(),
        });

        ExecutionResult {
            run_id,
            status: ExecutionStatus::Failed,
            step_results: ctx.into_step_results(),
            output: None,
            error: Some(message),
            engine_state: None,
            compensation,
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("cached_orders", &self.order_cache.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
