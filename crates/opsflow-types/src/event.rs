//! Progress events emitted during workflow execution.
//!
//! `EngineEvent` is broadcast to progress emitters (UI streams, logs). Events
//! are observational only; nothing in the engine reacts to them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events for a workflow run and its nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run started (or resumed from a checkpoint).
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
        workflow_name: String,
        resumed: bool,
    },

    /// A node was dispatched.
    StepStarted {
        run_id: Uuid,
        node_id: String,
        node_type: String,
    },

    /// A node completed successfully.
    StepCompleted {
        run_id: Uuid,
        node_id: String,
        duration_ms: u64,
    },

    /// A node was pruned by a condition and will never be dispatched.
    StepSkipped { run_id: Uuid, node_id: String },

    /// A node failed.
    StepFailed {
        run_id: Uuid,
        node_id: String,
        error: String,
    },

    /// The run halted at an approval node.
    RunSuspended { run_id: Uuid, node_id: String },

    /// The run completed.
    RunCompleted {
        run_id: Uuid,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// The run failed.
    RunFailed { run_id: Uuid, error: String },

    /// A rollback finished after a failure.
    CompensationFinished {
        run_id: Uuid,
        total: usize,
        succeeded: usize,
        failed: usize,
    },
}

impl EngineEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::StepStarted { run_id, .. }
            | EngineEvent::StepCompleted { run_id, .. }
            | EngineEvent::StepSkipped { run_id, .. }
            | EngineEvent::StepFailed { run_id, .. }
            | EngineEvent::RunSuspended { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. }
            | EngineEvent::CompensationFinished { run_id, .. } => *run_id,
        }
    }

    /// The node this event refers to, for node-scoped events.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EngineEvent::StepStarted { node_id, .. }
            | EngineEvent::StepCompleted { node_id, .. }
            | EngineEvent::StepSkipped { node_id, .. }
            | EngineEvent::StepFailed { node_id, .. }
            | EngineEvent::RunSuspended { node_id, .. } => Some(node_id),

            EngineEvent::RunStarted { .. }
            | EngineEvent::RunCompleted { .. }
            | EngineEvent::RunFailed { .. }
            | EngineEvent::CompensationFinished { .. } => None,
        }
    }
}
