//! Workflow domain types for Opsflow.
//!
//! Defines the immutable input the engine consumes (`WorkflowDefinition` with
//! its nodes and edges), the per-node configuration payloads, retry policy,
//! and the output shapes (`ExecutionResult`, `EngineState` checkpoint).
//!
//! Definitions are authored by the chat portal in JSON, so every struct here
//! uses camelCase field names on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Accumulated node results for a run, keyed by node ID in dispatch order.
pub type StepResults = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Host-assigned identifier.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Definition version. Together with `id` it identifies an immutable graph.
    #[serde(default = "default_version")]
    pub version: String,
    /// Nodes in declaration order. Declaration order breaks topological ties.
    pub nodes: Vec<WorkflowNode>,
    /// Directed dependency edges.
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Per-workflow budget and retry overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<WorkflowSettings>,
}

fn default_version() -> String {
    "1".to_string()
}

impl WorkflowDefinition {
    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Cache key for derived data (topological order). A definition is
    /// immutable for a given `id` + `version`.
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }
}

/// Per-workflow overrides of the engine-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout_ms: Option<u64>,
    /// Retry policy applied to tool calls that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryPolicy>,
}

/// A directed dependency between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl WorkflowEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single unit of work in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique within a definition.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node type and its configuration.
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
        }
    }

    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Node type with its type-specific configuration payload.
///
/// Adjacently tagged to match the portal's JSON:
/// ```json
/// { "id": "list", "type": "tool", "config": { "toolName": "oci_list_instances" } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "kebab-case")]
pub enum NodeKind {
    /// Passes the run's raw input through.
    Input,
    /// Invokes an external tool.
    Tool(ToolConfig),
    /// Evaluates a predicate and prunes the unselected branch.
    Condition(ConditionConfig),
    /// Human approval gate; suspends the run.
    Approval(ApprovalConfig),
    /// Shapes the final output from accumulated results.
    Output(OutputConfig),
    /// Delegates to the AI step handler.
    AiStep(AiStepConfig),
    /// Iterates over an array.
    Loop(LoopConfig),
    /// Fans out to concurrent branches.
    Parallel(ParallelConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Input => NodeType::Input,
            NodeKind::Tool(_) => NodeType::Tool,
            NodeKind::Condition(_) => NodeType::Condition,
            NodeKind::Approval(_) => NodeType::Approval,
            NodeKind::Output(_) => NodeType::Output,
            NodeKind::AiStep(_) => NodeType::AiStep,
            NodeKind::Loop(_) => NodeType::Loop,
            NodeKind::Parallel(_) => NodeType::Parallel,
        }
    }
}

/// Payload-free discriminant of [`NodeKind`], used in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Input,
    Tool,
    Condition,
    Approval,
    Output,
    AiStep,
    Loop,
    Parallel,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Input => "input",
            NodeType::Tool => "tool",
            NodeType::Condition => "condition",
            NodeType::Approval => "approval",
            NodeType::Output => "output",
            NodeType::AiStep => "ai-step",
            NodeType::Loop => "loop",
            NodeType::Parallel => "parallel",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a `tool` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    /// Tool to invoke. Required; validated at dispatch time.
    #[serde(default)]
    pub tool_name: String,
    /// Arguments; string values may contain `{{path}}` placeholders.
    #[serde(default)]
    pub args: Value,
    /// Per-node retry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Inverse action registered after this node succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<CompensateConfig>,
}

/// Declared inverse of a forward tool action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensateConfig {
    /// Tool invoked to undo the forward action.
    pub action: String,
    #[serde(default)]
    pub args: Value,
}

/// Configuration of a `condition` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    #[serde(default)]
    pub expression: String,
    /// Root node of the branch taken when the expression is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_branch: Option<String>,
    /// Root node of the branch taken when the expression is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_branch: Option<String>,
}

/// Configuration of an `approval` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    /// Message shown to the approver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Configuration of an `output` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    /// Output key -> dot path into the step results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,
}

/// Configuration of an `ai-step` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiStepConfig {
    /// Prompt template with `{{path}}` placeholders. Required.
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// JSON schema the handler result must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Configuration of a `loop` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// Dot path resolving to the array to iterate. Required.
    #[serde(default)]
    pub iterator_expression: String,
    #[serde(default = "default_iteration_variable")]
    pub iteration_variable: String,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Capped at the engine-wide ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Evaluated before each iteration's handler runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_condition: Option<String>,
}

fn default_iteration_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            iterator_expression: String::new(),
            iteration_variable: default_iteration_variable(),
            index_variable: default_index_variable(),
            execution_mode: ExecutionMode::default(),
            max_iterations: None,
            break_condition: None,
        }
    }
}

/// How loop iterations are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }
}

/// Configuration of a `parallel` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    /// Branch keys, one per concurrent branch. Must be non-empty.
    #[serde(default)]
    pub branch_node_ids: Vec<String>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Per-branch time limit; falls back to the node timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// How concurrently executed branch results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Wait for every branch.
    #[default]
    All,
    /// First branch to succeed.
    Any,
    /// Same as `Any`: first branch to succeed.
    First,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::All => "all",
            MergeStrategy::Any => "any",
            MergeStrategy::First => "first",
        }
    }
}

/// Failure policy for `MergeStrategy::All`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandling {
    #[default]
    FailFast,
    CollectAll,
}

impl ErrorHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorHandling::FailFast => "fail-fast",
            ErrorHandling::CollectAll => "collect-all",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = 1 + max_retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Fixed delay between attempts, no jitter.
    pub fn fixed(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            backoff_multiplier: 1.0,
            max_backoff_ms: backoff_ms,
            jitter: false,
        }
    }

    /// Resolve the effective policy: action override, then workflow default,
    /// then the standard default.
    pub fn resolve(action: Option<&RetryPolicy>, workflow: Option<&RetryPolicy>) -> RetryPolicy {
        action.or(workflow).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Execution output
// ---------------------------------------------------------------------------

/// Terminal (or paused) status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Suspended,
}

/// Serializable checkpoint produced when a run reaches an approval node.
///
/// The host persists it and hands it back to `resume` once the approval is
/// granted. Discarded on terminal completion or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    /// Run that produced the checkpoint.
    pub run_id: Uuid,
    /// Approval node the run halted at.
    pub suspended_at_node_id: String,
    /// Nodes already dispatched to completion.
    pub completed_node_ids: Vec<String>,
    /// Nodes pruned by a condition before the suspension.
    #[serde(default)]
    pub skipped_node_ids: Vec<String>,
    /// Results accumulated so far.
    pub step_results: StepResults,
}

/// Outcome of a single compensating action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationResult {
    pub node_id: String,
    pub compensate_action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a saga rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Per-entry results in execution (reverse registration) order.
    pub results: Vec<CompensationResult>,
}

/// Result of `execute` / `resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: ExecutionStatus,
    pub step_results: StepResults,
    /// Result of the last output node, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Human-readable failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present only when `status` is `Suspended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_state: Option<EngineState>,
    /// Present only when a rollback ran after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSummary>,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }

    pub fn is_suspended(&self) -> bool {
        self.status == ExecutionStatus::Suspended
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
