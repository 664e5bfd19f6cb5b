//! Loop and parallel control nodes.
//!
//! Both fan work out to injected handlers and join it back before the node
//! completes. Concurrent sub-tasks run as futures on the run task itself
//! (`futures_util` joins), each writing to its own index-addressed slot, so
//! no shared map or lock is involved.

use std::time::Duration;

use futures_util::future::{join_all, try_join_all};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};

use opsflow_types::workflow::{
    ErrorHandling, ExecutionMode, LoopConfig, MergeStrategy, ParallelConfig, RetryPolicy,
};

use super::budget::with_timeout;
use super::context::WorkflowContext;
use super::error::WorkflowError;
use super::expression::{resolve_path, safe_evaluate_expression};
use super::retry::with_retry;
use super::step_runner::StepRunner;

impl StepRunner<'_> {
    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    pub(super) async fn run_loop(
        &self,
        node_id: &str,
        cfg: &LoopConfig,
        ctx: &WorkflowContext,
    ) -> Result<Value, WorkflowError> {
        let expression = cfg.iterator_expression.trim();
        if expression.is_empty() {
            return Err(WorkflowError::missing_field(node_id, "iteratorExpression"));
        }

        let scope = ctx.scope();
        let items = match resolve_path(&scope, expression).as_deref() {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                return Err(WorkflowError::Validation(format!(
                    "loop '{node_id}': iteratorExpression '{expression}' must resolve to an array"
                )));
            }
        };

        let ceiling = self.config.max_loop_iterations;
        let limit = cfg.max_iterations.map_or(ceiling, |m| m.min(ceiling)) as usize;
        let eligible = &items[..items.len().min(limit)];

        let breaks_at = |index: usize, item: &Value| {
            cfg.break_condition.as_deref().is_some_and(|condition| {
                let scope =
                    ctx.iteration_scope(&cfg.iteration_variable, item, &cfg.index_variable, index);
                safe_evaluate_expression(condition, &scope)
            })
        };

        let (results, break_index) = match cfg.execution_mode {
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(eligible.len());
                let mut break_index = None;
                for (index, item) in eligible.iter().enumerate() {
                    if breaks_at(index, item) {
                        break_index = Some(index);
                        break;
                    }
                    results.push(self.run_iteration(node_id, cfg, ctx, index, item).await?);
                }
                (results, break_index)
            }
            ExecutionMode::Parallel => {
                let mut break_index = None;
                let mut runnable = Vec::new();
                for (index, item) in eligible.iter().enumerate() {
                    if breaks_at(index, item) {
                        break_index.get_or_insert(index);
                    } else {
                        runnable.push((index, item));
                    }
                }
                let results = try_join_all(
                    runnable
                        .into_iter()
                        .map(|(index, item)| self.run_iteration(node_id, cfg, ctx, index, item)),
                )
                .await?;
                (results, break_index)
            }
        };

        tracing::debug!(
            node_id,
            iterations = results.len(),
            break_triggered = break_index.is_some(),
            mode = cfg.execution_mode.as_str(),
            "loop finished"
        );

        let mut output = json!({
            "items": results,
            "totalIterations": results.len(),
            "breakTriggered": break_index.is_some(),
            "executionMode": cfg.execution_mode.as_str(),
        });
        if let (Some(next_index), Value::Object(map)) = (break_index, &mut output) {
            map.insert("resumeToken".to_string(), json!({ "nextIndex": next_index }));
        }
        Ok(output)
    }

    /// One iteration: bounded fixed-delay retry around a timed handler call.
    async fn run_iteration(
        &self,
        node_id: &str,
        cfg: &LoopConfig,
        ctx: &WorkflowContext,
        index: usize,
        item: &Value,
    ) -> Result<Value, WorkflowError> {
        let policy = RetryPolicy::fixed(
            self.config.loop_item_max_retries,
            self.config.loop_item_backoff_ms,
        );
        let handler = self.collaborators.loop_handler.as_ref();
        let clock = self.clock();
        let timeout = self.budget.node_timeout();
        let what = format!("loop '{node_id}' iteration {index}");

        let outcome = with_retry(&policy, clock, |_| {
            let scope =
                ctx.iteration_scope(&cfg.iteration_variable, item, &cfg.index_variable, index);
            let call = handler.run_iteration(item.clone(), index, scope);
            let what = what.as_str();
            async move {
                with_timeout(clock, timeout, what, call)
                    .await?
                    .map_err(|e| WorkflowError::Handler(format!("{what}: {e}")))
            }
        })
        .await;

        outcome.map(|done| done.value).map_err(|exhausted| exhausted.error)
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    pub(super) async fn run_parallel(
        &self,
        node_id: &str,
        cfg: &ParallelConfig,
        ctx: &WorkflowContext,
    ) -> Result<Value, WorkflowError> {
        if cfg.branch_node_ids.is_empty() {
            return Err(WorkflowError::missing_field(node_id, "branchNodeIds"));
        }

        let timeout = cfg
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.budget.node_timeout());
        let branches = &cfg.branch_node_ids;

        let mut results = Map::new();
        let (succeeded, failed) = match (cfg.merge_strategy, cfg.error_handling) {
            (MergeStrategy::All, ErrorHandling::FailFast) => {
                let values = try_join_all(
                    branches
                        .iter()
                        .map(|branch| self.run_branch(node_id, branch, ctx, timeout)),
                )
                .await?;
                for (branch, value) in branches.iter().zip(values) {
                    results.insert(branch.clone(), value);
                }
                (branches.len(), 0)
            }
            (MergeStrategy::All, ErrorHandling::CollectAll) => {
                let outcomes = join_all(
                    branches
                        .iter()
                        .map(|branch| self.run_branch(node_id, branch, ctx, timeout)),
                )
                .await;
                let mut failed = 0;
                for (branch, outcome) in branches.iter().zip(outcomes) {
                    let value = outcome.unwrap_or_else(|e| {
                        failed += 1;
                        json!({ "error": e.to_string() })
                    });
                    results.insert(branch.clone(), value);
                }
                (branches.len() - failed, failed)
            }
            (MergeStrategy::Any | MergeStrategy::First, _) => {
                let (branch, value, failed) = self.first_success(node_id, cfg, ctx, timeout).await?;
                results.insert(branch, value);
                (1, failed)
            }
        };

        tracing::debug!(
            node_id,
            strategy = cfg.merge_strategy.as_str(),
            succeeded,
            failed,
            "parallel node finished"
        );

        Ok(json!({
            "mergeStrategy": cfg.merge_strategy.as_str(),
            "errorHandling": cfg.error_handling.as_str(),
            "results": results,
            "succeeded": succeeded,
            "failed": failed,
        }))
    }

    /// Race all branches; the first success wins and the rest are dropped.
    /// Fails only when every branch failed.
    async fn first_success(
        &self,
        node_id: &str,
        cfg: &ParallelConfig,
        ctx: &WorkflowContext,
        timeout: Duration,
    ) -> Result<(String, Value, usize), WorkflowError> {
        let mut pending: FuturesUnordered<_> = cfg
            .branch_node_ids
            .iter()
            .map(|branch| async move {
                (branch, self.run_branch(node_id, branch, ctx, timeout).await)
            })
            .collect();

        let mut failed = 0;
        let mut last_error = None;
        while let Some((branch, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => return Ok((branch.clone(), value, failed)),
                Err(e) => {
                    tracing::debug!(node_id, branch = %branch, error = %e, "branch failed");
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        Err(WorkflowError::Handler(format!(
            "parallel '{node_id}': all {failed} branches failed; last error: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn run_branch(
        &self,
        node_id: &str,
        branch: &str,
        ctx: &WorkflowContext,
        timeout: Duration,
    ) -> Result<Value, WorkflowError> {
        let what = format!("parallel '{node_id}' branch '{branch}'");
        let call = self.collaborators.branch_handler.run_branch(branch, ctx);
        with_timeout(self.clock(), timeout, &what, call)
            .await?
            .map_err(|e| WorkflowError::Handler(format!("{what}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::{Arc, Mutex};

    use futures_util::future::BoxFuture;
    use opsflow_types::config::EngineConfig;
    use opsflow_types::workflow::{NodeKind, WorkflowDefinition, WorkflowNode};

    use super::*;
    use crate::workflow::budget::RunBudget;
    use crate::workflow::clock::TokioClock;
    use crate::workflow::handler::{
        LoopIterationHandler, ParallelBranchHandler, PassThroughBranch, PassThroughIteration,
    };
    use crate::workflow::step_runner::{Collaborators, StepOutcome};
    use crate::workflow::test_support::{CountingToolExecutor, RecordingClock};

    /// Iteration handler that fails a fixed number of times per index.
    #[derive(Default)]
    struct FlakyIterations {
        failures_left: Mutex<BTreeMap<usize, u32>>,
        calls: Mutex<Vec<usize>>,
    }

    impl FlakyIterations {
        fn failing(index: usize, times: u32) -> Self {
            let handler = Self::default();
            handler.failures_left.lock().unwrap().insert(index, times);
            handler
        }
    }

    impl LoopIterationHandler for FlakyIterations {
        fn run_iteration(
            &self,
            item: Value,
            index: usize,
            _scope: Value,
        ) -> BoxFuture<'_, Result<Value, String>> {
            self.calls.lock().unwrap().push(index);
            let mut left = self.failures_left.lock().unwrap();
            let result = match left.get_mut(&index) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(format!("iteration {index} flaked"))
                }
                _ => Ok(json!({ "processed": item })),
            };
            Box::pin(async move { result })
        }
    }

    /// Branch handler with scripted failures and per-branch delays.
    #[derive(Default)]
    struct ScriptedBranches {
        failing: HashSet<String>,
        delays_ms: BTreeMap<String, u64>,
    }

    impl ParallelBranchHandler for ScriptedBranches {
        fn run_branch<'a>(
            &'a self,
            branch_id: &'a str,
            _ctx: &'a WorkflowContext,
        ) -> BoxFuture<'a, Result<Value, String>> {
            Box::pin(async move {
                if let Some(ms) = self.delays_ms.get(branch_id) {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                }
                if self.failing.contains(branch_id) {
                    Err(format!("{branch_id} exploded"))
                } else {
                    Ok(json!({ "branch": branch_id }))
                }
            })
        }
    }

    struct Fixture {
        collaborators: Collaborators,
        config: EngineConfig,
        definition: WorkflowDefinition,
        order: Vec<String>,
        budget: RunBudget,
    }

    impl Fixture {
        fn new(node: WorkflowNode) -> Self {
            Self::with_handlers(
                node,
                Arc::new(PassThroughIteration),
                Arc::new(PassThroughBranch),
                Arc::new(RecordingClock::new()),
            )
        }

        fn with_handlers(
            node: WorkflowNode,
            loop_handler: Arc<dyn LoopIterationHandler>,
            branch_handler: Arc<dyn ParallelBranchHandler>,
            clock: Arc<dyn crate::workflow::clock::Clock>,
        ) -> Self {
            let config = EngineConfig::default();
            let budget = RunBudget::resolve(None, &config, clock.as_ref());
            let order = vec![node.id.clone()];
            Self {
                collaborators: Collaborators {
                    tools: Arc::new(CountingToolExecutor::new()),
                    ai: None,
                    loop_handler,
                    branch_handler,
                    clock,
                },
                config,
                definition: WorkflowDefinition {
                    id: "wf".to_string(),
                    name: "wf".to_string(),
                    version: "1".to_string(),
                    nodes: vec![node],
                    edges: Vec::new(),
                    settings: None,
                },
                order,
                budget,
            }
        }

        async fn run(&self, ctx: &WorkflowContext) -> Result<Value, WorkflowError> {
            let runner = StepRunner::new(
                &self.collaborators,
                &self.config,
                &self.definition,
                &self.order,
                &self.budget,
            );
            match runner.run(&self.definition.nodes[0], ctx, &HashSet::new()).await? {
                StepOutcome::Completed(value) => Ok(value),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    fn loop_node(cfg: LoopConfig) -> WorkflowNode {
        WorkflowNode::new("each", NodeKind::Loop(cfg))
    }

    fn parallel_node(branches: &[&str], merge: MergeStrategy, errors: ErrorHandling) -> WorkflowNode {
        WorkflowNode::new(
            "fan",
            NodeKind::Parallel(ParallelConfig {
                branch_node_ids: branches.iter().map(|b| b.to_string()).collect(),
                merge_strategy: merge,
                error_handling: errors,
                timeout_ms: None,
            }),
        )
    }

    fn ctx_with(items: Value) -> WorkflowContext {
        WorkflowContext::new(json!({ "items": items }))
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn loop_respects_max_iterations() {
        let fx = Fixture::new(loop_node(LoopConfig {
            iterator_expression: "input.items".to_string(),
            max_iterations: Some(2),
            ..LoopConfig::default()
        }));

        let out = fx.run(&ctx_with(json!(["a", "b", "c", "d", "e"]))).await.unwrap();
        assert_eq!(out["items"], json!(["a", "b"]));
        assert_eq!(out["totalIterations"], 2);
        assert_eq!(out["breakTriggered"], false);
        assert!(out.get("resumeToken").is_none());
    }

    #[tokio::test]
    async fn loop_breaks_sequentially() {
        let fx = Fixture::new(loop_node(LoopConfig {
            iterator_expression: "input.items".to_string(),
            break_condition: Some("item == 3".to_string()),
            ..LoopConfig::default()
        }));

        let out = fx.run(&ctx_with(json!([1, 2, 3, 4, 5]))).await.unwrap();
        assert_eq!(out["breakTriggered"], true);
        assert_eq!(out["items"], json!([1, 2]));
        assert!(out["totalIterations"].as_u64().unwrap() < 5);
        assert_eq!(out["resumeToken"]["nextIndex"], 2);
        assert_eq!(out["executionMode"], "sequential");
    }

    #[tokio::test]
    async fn parallel_loop_runs_every_non_breaking_iteration() {
        let fx = Fixture::new(loop_node(LoopConfig {
            iterator_expression: "input.items".to_string(),
            execution_mode: ExecutionMode::Parallel,
            break_condition: Some("index == 1".to_string()),
            ..LoopConfig::default()
        }));

        let out = fx.run(&ctx_with(json!(["a", "b", "c"]))).await.unwrap();
        assert_eq!(out["items"], json!(["a", "c"]));
        assert_eq!(out["breakTriggered"], true);
        assert_eq!(out["resumeToken"]["nextIndex"], 1);
    }

    #[tokio::test]
    async fn loop_honours_custom_variable_names() {
        let fx = Fixture::new(loop_node(LoopConfig {
            iterator_expression: "input.items".to_string(),
            iteration_variable: "instance".to_string(),
            index_variable: "i".to_string(),
            break_condition: Some("instance.state == \"STOPPED\"".to_string()),
            ..LoopConfig::default()
        }));

        let items = json!([{ "state": "RUNNING" }, { "state": "STOPPED" }]);
        let out = fx.run(&ctx_with(items)).await.unwrap();
        assert_eq!(out["totalIterations"], 1);
    }

    #[tokio::test]
    async fn loop_requires_array_source() {
        let fx = Fixture::new(loop_node(LoopConfig {
            iterator_expression: "input.items".to_string(),
            ..LoopConfig::default()
        }));
        let err = fx.run(&ctx_with(json!("not a list"))).await.unwrap_err();
        assert!(err.to_string().contains("array"));

        let fx = Fixture::new(loop_node(LoopConfig::default()));
        let err = fx.run(&ctx_with(json!([]))).await.unwrap_err();
        assert!(err.to_string().contains("iteratorExpression"));
    }

    #[tokio::test]
    async fn loop_iteration_retries_then_succeeds() {
        let handler = Arc::new(FlakyIterations::failing(1, 2));
        let clock = Arc::new(RecordingClock::new());
        let fx = Fixture::with_handlers(
            loop_node(LoopConfig {
                iterator_expression: "input.items".to_string(),
                ..LoopConfig::default()
            }),
            handler.clone(),
            Arc::new(PassThroughBranch),
            clock.clone(),
        );

        let out = fx.run(&ctx_with(json!(["x", "y"]))).await.unwrap();
        assert_eq!(out["items"][1], json!({ "processed": "y" }));
        assert_eq!(*handler.calls.lock().unwrap(), vec![0, 1, 1, 1]);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100); 2]);
    }

    #[tokio::test]
    async fn loop_iteration_exhaustion_fails_node() {
        let handler = Arc::new(FlakyIterations::failing(0, 5));
        let fx = Fixture::with_handlers(
            loop_node(LoopConfig {
                iterator_expression: "input.items".to_string(),
                ..LoopConfig::default()
            }),
            handler.clone(),
            Arc::new(PassThroughBranch),
            Arc::new(RecordingClock::new()),
        );

        let err = fx.run(&ctx_with(json!(["x", "y"]))).await.unwrap_err();
        assert!(err.to_string().contains("iteration 0"));
        assert_eq!(handler.calls.lock().unwrap().len(), 3);
    }

    /// Iteration handler that never finishes within a node timeout.
    #[derive(Default)]
    struct StuckIterations {
        calls: Mutex<u32>,
    }

    impl LoopIterationHandler for StuckIterations {
        fn run_iteration(
            &self,
            _item: Value,
            _index: usize,
            _scope: Value,
        ) -> BoxFuture<'_, Result<Value, String>> {
            *self.calls.lock().unwrap() += 1;
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!("late"))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_iteration_times_out_after_bounded_retries() {
        let handler = Arc::new(StuckIterations::default());
        let mut fx = Fixture::with_handlers(
            loop_node(LoopConfig {
                iterator_expression: "input.items".to_string(),
                ..LoopConfig::default()
            }),
            handler.clone(),
            Arc::new(PassThroughBranch),
            Arc::new(TokioClock::new()),
        );
        fx.budget.node_timeout_ms = 100;

        let err = fx.run(&ctx_with(json!(["x"]))).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out after 100ms"));
        assert!(err.to_string().contains("iteration 0"));
        assert_eq!(
            *handler.calls.lock().unwrap(),
            1 + fx.config.loop_item_max_retries
        );
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn parallel_all_collects_every_branch() {
        let fx = Fixture::new(parallel_node(
            &["a", "b", "c"],
            MergeStrategy::All,
            ErrorHandling::FailFast,
        ));

        let out = fx.run(&WorkflowContext::new(json!({}))).await.unwrap();
        assert_eq!(out["results"].as_object().unwrap().len(), 3);
        assert_eq!(out["succeeded"], 3);
        assert_eq!(out["results"]["b"], json!({ "branch": "b", "input": {} }));
    }

    #[tokio::test]
    async fn parallel_any_and_first_keep_one_result() {
        for merge in [MergeStrategy::Any, MergeStrategy::First] {
            let fx = Fixture::new(parallel_node(&["a", "b", "c"], merge, ErrorHandling::FailFast));
            let out = fx.run(&WorkflowContext::new(json!({}))).await.unwrap();
            assert_eq!(out["results"].as_object().unwrap().len(), 1);
            assert_eq!(out["mergeStrategy"], merge.as_str());
        }
    }

    #[tokio::test]
    async fn parallel_fail_fast_propagates_branch_error() {
        let branches = ScriptedBranches {
            failing: HashSet::from(["b".to_string()]),
            ..ScriptedBranches::default()
        };
        let fx = Fixture::with_handlers(
            parallel_node(&["a", "b"], MergeStrategy::All, ErrorHandling::FailFast),
            Arc::new(PassThroughIteration),
            Arc::new(branches),
            Arc::new(RecordingClock::new()),
        );

        let err = fx.run(&WorkflowContext::default()).await.unwrap_err();
        assert!(err.to_string().contains("b exploded"));
    }

    #[tokio::test]
    async fn parallel_collect_all_records_errors() {
        let branches = ScriptedBranches {
            failing: HashSet::from(["b".to_string()]),
            ..ScriptedBranches::default()
        };
        let fx = Fixture::with_handlers(
            parallel_node(&["a", "b"], MergeStrategy::All, ErrorHandling::CollectAll),
            Arc::new(PassThroughIteration),
            Arc::new(branches),
            Arc::new(RecordingClock::new()),
        );

        let out = fx.run(&WorkflowContext::default()).await.unwrap();
        assert_eq!(out["succeeded"], 1);
        assert_eq!(out["failed"], 1);
        assert!(out["results"]["b"]["error"]
            .as_str()
            .unwrap()
            .contains("b exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_first_skips_failures_and_slow_branches() {
        let branches = ScriptedBranches {
            failing: HashSet::from(["fast_broken".to_string()]),
            delays_ms: BTreeMap::from([
                ("fast_broken".to_string(), 5),
                ("steady".to_string(), 50),
                ("slow".to_string(), 500),
            ]),
        };
        let fx = Fixture::with_handlers(
            parallel_node(
                &["fast_broken", "steady", "slow"],
                MergeStrategy::First,
                ErrorHandling::FailFast,
            ),
            Arc::new(PassThroughIteration),
            Arc::new(branches),
            Arc::new(TokioClock::new()),
        );

        let out = fx.run(&WorkflowContext::default()).await.unwrap();
        assert!(out["results"].get("steady").is_some());
        assert_eq!(out["failed"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_branch_timeout_is_reported() {
        let branches = ScriptedBranches {
            delays_ms: BTreeMap::from([("slow".to_string(), 5_000)]),
            ..ScriptedBranches::default()
        };
        let mut node = parallel_node(&["slow"], MergeStrategy::All, ErrorHandling::CollectAll);
        if let NodeKind::Parallel(cfg) = &mut node.kind {
            cfg.timeout_ms = Some(100);
        }
        let fx = Fixture::with_handlers(
            node,
            Arc::new(PassThroughIteration),
            Arc::new(branches),
            Arc::new(TokioClock::new()),
        );

        let out = fx.run(&WorkflowContext::default()).await.unwrap();
        assert!(out["results"]["slow"]["error"]
            .as_str()
            .unwrap()
            .contains("timed out after 100ms"));
    }

    #[tokio::test]
    async fn parallel_requires_branches() {
        let fx = Fixture::new(parallel_node(&[], MergeStrategy::All, ErrorHandling::FailFast));
        let err = fx.run(&WorkflowContext::default()).await.unwrap_err();
        assert!(err.to_string().contains("branchNodeIds"));
    }

    #[tokio::test]
    async fn parallel_any_fails_when_every_branch_fails() {
        let branches = ScriptedBranches {
            failing: HashSet::from(["a".to_string(), "b".to_string()]),
            ..ScriptedBranches::default()
        };
        let fx = Fixture::with_handlers(
            parallel_node(&["a", "b"], MergeStrategy::Any, ErrorHandling::FailFast),
            Arc::new(PassThroughIteration),
            Arc::new(branches),
            Arc::new(RecordingClock::new()),
        );

        let err = fx.run(&WorkflowContext::default()).await.unwrap_err();
        assert!(err.to_string().contains("all 2 branches failed"));
    }
}
