//! Shared domain types for Opsflow.
//!
//! Workflow definitions, engine checkpoints, execution results, progress
//! events and engine configuration.
//!
//! Zero infrastructure dependencies: only serde, serde_json and uuid.

pub mod config;
pub mod event;
pub mod workflow;
