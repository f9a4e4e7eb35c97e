//! Workspace checkpoints taken around every agent attempt.
//!
//! A checkpoint is created before each attempt, rolled back when the attempt
//! fails, and committed once the attempt's output validates.

pub mod git;

pub use git::{GitCheckpointStore, ensure_repository};

use anyhow::Result;
use async_trait::async_trait;

/// Reference to a restorable workspace snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: String,
    pub label: String,
    pub attempt: u32,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Snapshot the workspace before `attempt` of `label`.
    async fn create(&self, label: &str, attempt: u32) -> Result<Checkpoint>;

    /// Restore the workspace to `checkpoint`, discarding whatever the attempt wrote.
    async fn rollback(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Keep the workspace as-is and record it. Returns the id of the recorded state.
    async fn commit(&self, checkpoint: &Checkpoint) -> Result<String>;
}
