//! Shared domain types for warden.
//!
//! The orchestrator publishes [`RunSnapshot`]s and the progress bridge consumes
//! them through the [`ProgressSource`] / [`StatusSource`] contracts. Neither side
//! depends on the other's internals, only on this crate.

pub mod run;
pub mod source;

pub use run::{AgentMetrics, RunDescription, RunSnapshot, RunStatus, RunSummary, WorkflowStatus};
pub use source::{ProgressSource, QueryError, StatusSource};
