//! Observability setup for Opsflow hosts.

pub mod tracing_setup;
