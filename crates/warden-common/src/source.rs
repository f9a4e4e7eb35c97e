//! Query contracts between a running pipeline and its observers.

use async_trait::async_trait;
use thiserror::Error;

use crate::run::{RunDescription, RunSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("run '{0}' not found")]
    NotFound(String),

    /// The run exists but has not published its first snapshot yet.
    #[error("run '{0}' has not initialized its progress record")]
    NotReady(String),

    #[error("run worker unreachable: {0}")]
    Unreachable(String),

    #[error("query failed: {0}")]
    Transient(String),
}

impl QueryError {
    /// True when the progress query cannot answer at all and the caller should
    /// ask the authoritative status source instead.
    pub fn needs_status_fallback(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unreachable(_))
    }
}

/// Read-only view of a run's progress record.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn get_progress(&self, run_id: &str) -> Result<RunSnapshot, QueryError>;
}

/// Ground truth about a run's lifecycle, independent of its progress record.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn describe(&self, run_id: &str) -> Result<RunDescription, QueryError>;
}
