//! Workflow engine core: graph validation, node dispatch, retries, saga
//! compensation and run budgets.
//!
//! - `dag` -- structural validation, cycle detection, topological order, branch pruning
//! - `expression` -- safe condition mini-language and `{{path}}` templates
//! - `context` -- run input plus accumulated step results
//! - `step_runner` / `control` -- per-node dispatch, loop and parallel nodes
//! - `retry` / `compensation` / `saga` -- backoff retries and LIFO rollback
//! - `budget` / `clock` -- step, duration and per-node time limits
//! - `executor` -- `WorkflowEngine` with execute, resume and cancellation

pub mod budget;
pub mod clock;
pub mod compensation;
pub mod context;
mod control;
pub mod dag;
pub mod error;
pub mod executor;
pub mod expression;
pub mod handler;
pub mod retry;
pub mod saga;
pub mod schema;
pub mod step_runner;

#[cfg(test)]
pub(crate) mod test_support;
