//! Typed error hierarchy for warden.
//!
//! Three enums cover the three layers a failure can travel through:
//! - `AgentError`: a single attempt of the unit-of-work runner
//! - `ExecutorError`: a unit after the retry executor has given up on it
//! - `OrchestratorError`: the pipeline run as a whole

use thiserror::Error;

use crate::retry::ErrorKind;

/// Errors from one attempt of the agent runner.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to write prompt file at {path}: {source}")]
    PromptWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output file at {path}: {source}")]
    OutputWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The agent ran and reported failure; the text is what gets classified.
    #[error("{0}")]
    Execution(String),

    #[error("Agent exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Agent timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the retry executor once a unit cannot succeed.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{agent} failed with non-retryable {kind} error on attempt {attempt}: {source}")]
    NonRetryable {
        agent: String,
        attempt: u32,
        kind: ErrorKind,
        #[source]
        source: AgentError,
    },

    #[error("{agent} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        agent: String,
        attempts: u32,
        #[source]
        source: AgentError,
    },

    #[error("{agent} output validation failed on all {attempts} attempts")]
    ValidationExhausted { agent: String, attempts: u32 },

    #[error("Checkpoint error for {agent}: {source}")]
    Checkpoint {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Validator error for {agent}: {source}")]
    Validator {
        agent: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ExecutorError {
    pub fn agent(&self) -> &str {
        match self {
            Self::NonRetryable { agent, .. }
            | Self::RetriesExhausted { agent, .. }
            | Self::ValidationExhausted { agent, .. }
            | Self::Checkpoint { agent, .. }
            | Self::Validator { agent, .. } => agent,
        }
    }
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Agent {agent} failed: {source}")]
    AgentFailed {
        agent: String,
        #[source]
        source: ExecutorError,
    },

    #[error("Exploitation gate for {class} failed: {message}")]
    Gating { class: String, message: String },

    #[error("Activity dispatch failed: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
