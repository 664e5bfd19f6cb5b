//! Workflow orchestration engine for cloud-operations automation.
//!
//! Depends only on `opsflow-types`. Tools, AI calls and checkpoint storage
//! are injected by the host through the traits in [`workflow::handler`].

pub mod event;
pub mod workflow;

pub use workflow::error::WorkflowError;
pub use workflow::executor::{WorkflowEngine, WorkflowEngineBuilder};
