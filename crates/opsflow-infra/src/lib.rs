//! Infrastructure adapters for Opsflow.
//!
//! Implements the host-facing pieces the engine core leaves out: reading the
//! engine configuration from disk and logging progress events.

pub mod config;
pub mod progress;
