//! Event distribution for workflow progress.

pub mod bus;
