//! Run context: raw input plus accumulated step results.
//!
//! `WorkflowContext` is the only mutable state a run carries between nodes.
//! It is owned by the run loop; node handlers receive shared references and
//! build read-only expression scopes from it.

use serde_json::{Map, Value};

use opsflow_types::workflow::StepResults;

use super::expression::interpolate_template;

/// Mutable state that flows through a workflow run.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    input: Value,
    step_results: StepResults,
}

impl WorkflowContext {
    /// Fresh context for a new run.
    pub fn new(input: Value) -> Self {
        Self {
            input,
            step_results: StepResults::new(),
        }
    }

    /// Context restored from a checkpoint.
    pub fn restore(input: Value, step_results: StepResults) -> Self {
        Self {
            input,
            step_results,
        }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn step_results(&self) -> &StepResults {
        &self.step_results
    }

    pub fn into_step_results(self) -> StepResults {
        self.step_results
    }

    pub fn step_result(&self, node_id: &str) -> Option<&Value> {
        self.step_results.get(node_id)
    }

    /// Record the result of a dispatched node.
    ///
    /// Results are append-only: a node ID is recorded at most once per run.
    pub fn record(&mut self, node_id: &str, result: Value) {
        if self.step_results.contains_key(node_id) {
            tracing::warn!(node_id, "step result already recorded, keeping the first");
            return;
        }
        self.step_results.insert(node_id.to_string(), result);
    }

    /// `{input, ...stepResults}`: the scope for templates, loop sources and
    /// output mappings that reference the raw input.
    pub fn scope(&self) -> Value {
        let mut scope = Map::new();
        scope.insert("input".to_string(), self.input.clone());
        for (id, result) in &self.step_results {
            scope.insert(id.clone(), result.clone());
        }
        Value::Object(scope)
    }

    /// `{result, input: stepResults, ...stepResults}`: the scope a condition
    /// node evaluates against. `result` is the predecessor's output.
    pub fn condition_scope(&self, predecessor_output: Option<&Value>) -> Value {
        let mut scope = Map::new();
        scope.insert(
            "result".to_string(),
            predecessor_output.cloned().unwrap_or(Value::Null),
        );
        scope.insert(
            "input".to_string(),
            Value::Object(self.step_results.clone()),
        );
        for (id, result) in &self.step_results {
            scope.insert(id.clone(), result.clone());
        }
        Value::Object(scope)
    }

    /// Loop iteration scope: [`scope`](Self::scope) plus the iteration and
    /// index variables.
    pub fn iteration_scope(
        &self,
        item_variable: &str,
        item: &Value,
        index_variable: &str,
        index: usize,
    ) -> Value {
        let mut scope = self.scope();
        if let Value::Object(map) = &mut scope {
            map.insert(item_variable.to_string(), item.clone());
            map.insert(index_variable.to_string(), Value::from(index));
        }
        scope
    }

    /// Interpolate `{{path}}` placeholders in every string inside `value`.
    pub fn interpolate_value(&self, value: &Value) -> Value {
        let scope = self.scope();
        interpolate_in(value, &scope)
    }

    /// Interpolate `{{path}}` placeholders in a template string.
    pub fn interpolate(&self, template: &str) -> String {
        interpolate_template(template, &self.scope())
    }
}

fn interpolate_in(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) if s.contains("{{") => Value::String(interpolate_template(s, scope)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_in(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_in(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}
