//! In-process stand-in for a durable execution service.
//!
//! Each run gets a supervisor task that owns the orchestrator task. The
//! orchestrator publishes its record on a watch channel (the query view);
//! the supervisor alone decides the authoritative lifecycle status from how
//! the orchestrator task ended. The two views can disagree: a cancelled run
//! keeps reporting `running` in its last published record while its
//! authoritative status is already `terminated`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_common::{
    ProgressSource, QueryError, RunDescription, RunSnapshot, StatusSource, WorkflowStatus,
};

use super::orchestrator::{Orchestrator, SubPipelineOutcome};
use super::state::RunState;

/// How long a closed run stays queryable before [`RunRegistry::start`] evicts it.
pub const CLOSED_RUN_RETENTION_SECS: i64 = 3600;

struct RunEntry {
    progress: watch::Receiver<Option<RunSnapshot>>,
    description: watch::Receiver<RunDescription>,
    cancel: CancellationToken,
}

/// What a supervised run left behind.
#[derive(Debug, Clone)]
pub struct FinishedRun {
    pub description: RunDescription,
    pub snapshot: Option<RunSnapshot>,
    pub sub_pipelines: Vec<SubPipelineOutcome>,
    pub error: Option<String>,
}

/// Live handle returned by [`RunRegistry::start`].
pub struct RunHandle {
    run_id: String,
    progress: watch::Receiver<Option<RunSnapshot>>,
    supervisor: JoinHandle<FinishedRun>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Copy of the latest published record, `None` before initialization.
    pub fn query(&self) -> Option<RunSnapshot> {
        self.progress.borrow().clone()
    }

    pub async fn wait(self) -> anyhow::Result<FinishedRun> {
        self.supervisor
            .await
            .map_err(|e| anyhow::anyhow!("Run supervisor for {} failed: {}", self.run_id, e))
    }
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<String, RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `run_id` and start executing `orchestrator` for it.
    pub fn start(&self, run_id: &str, orchestrator: Orchestrator) -> anyhow::Result<RunHandle> {
        let start_time = Utc::now();
        let (progress_tx, progress_rx) = watch::channel(None);
        let (description_tx, description_rx) = watch::channel(RunDescription {
            run_id: run_id.to_string(),
            status: WorkflowStatus::Running,
            start_time,
            close_time: None,
        });
        let cancel = CancellationToken::new();

        self.prune_closed(start_time, chrono::Duration::seconds(CLOSED_RUN_RETENTION_SECS));
        match self.runs.entry(run_id.to_string()) {
            Entry::Occupied(_) => anyhow::bail!("Run {} already exists", run_id),
            Entry::Vacant(slot) => {
                slot.insert(RunEntry {
                    progress: progress_rx.clone(),
                    description: description_rx,
                    cancel: cancel.clone(),
                });
            }
        }

        let worker_run_id = run_id.to_string();
        let mut worker = tokio::spawn(async move {
            let mut state = RunState::new(&worker_run_id, start_time, progress_tx);
            orchestrator.run(&mut state).await
        });

        let supervisor_run_id = run_id.to_string();
        let supervisor_progress = progress_rx.clone();
        let supervisor = tokio::spawn(async move {
            let (status, sub_pipelines, error) = tokio::select! {
                joined = &mut worker => match joined {
                    Ok(Ok(outcome)) => (WorkflowStatus::Completed, outcome.sub_pipelines, None),
                    Ok(Err(e)) => (WorkflowStatus::Failed, Vec::new(), Some(e.to_string())),
                    Err(e) => (WorkflowStatus::Failed, Vec::new(), Some(format!("Run task panicked: {}", e))),
                },
                _ = cancel.cancelled() => {
                    worker.abort();
                    (WorkflowStatus::Terminated, Vec::new(), Some("Run was terminated".to_string()))
                }
            };

            description_tx.send_modify(|d| {
                d.status = status;
                d.close_time = Some(Utc::now());
            });
            tracing::info!(run_id = %supervisor_run_id, status = %status, "run closed");

            FinishedRun {
                description: description_tx.borrow().clone(),
                snapshot: supervisor_progress.borrow().clone(),
                sub_pipelines,
                error,
            }
        });

        Ok(RunHandle {
            run_id: run_id.to_string(),
            progress: progress_rx,
            supervisor,
        })
    }

    /// Terminate a run out-of-band. Returns `false` when it had already closed.
    pub fn cancel(&self, run_id: &str) -> Result<bool, QueryError> {
        let entry = self
            .runs
            .get(run_id)
            .ok_or_else(|| QueryError::NotFound(run_id.to_string()))?;
        if entry.description.borrow().status.is_terminal() {
            return Ok(false);
        }
        entry.cancel.cancel();
        Ok(true)
    }

    /// Drop runs that closed more than `retention` before `now`. Returns how many went.
    pub fn prune_closed(&self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        let before = self.runs.len();
        self.runs.retain(|_, entry| {
            let description = entry.description.borrow();
            match description.close_time {
                Some(closed) if description.status.is_terminal() => now - closed < retention,
                _ => true,
            }
        });
        let pruned = before.saturating_sub(self.runs.len());
        if pruned > 0 {
            tracing::debug!(pruned, "evicted closed runs");
        }
        pruned
    }

    pub fn list(&self) -> Vec<RunDescription> {
        let mut runs: Vec<RunDescription> = self
            .runs
            .iter()
            .map(|entry| entry.description.borrow().clone())
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }
}

#[async_trait]
impl ProgressSource for RunRegistry {
    async fn get_progress(&self, run_id: &str) -> Result<RunSnapshot, QueryError> {
        let entry = self
            .runs
            .get(run_id)
            .ok_or_else(|| QueryError::NotFound(run_id.to_string()))?;
        let snapshot = entry.progress.borrow().clone();
        snapshot.ok_or_else(|| QueryError::NotReady(run_id.to_string()))
    }
}

#[async_trait]
impl StatusSource for RunRegistry {
    async fn describe(&self, run_id: &str) -> Result<RunDescription, QueryError> {
        let entry = self
            .runs
            .get(run_id)
            .ok_or_else(|| QueryError::NotFound(run_id.to_string()))?;
        let description = entry.description.borrow().clone();
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentName, AgentOutcome, QueueDecision, VulnClass};
    use crate::errors::{AgentError, ExecutorError};
    use crate::pipeline::{ActivityDispatcher, PipelinePlan};
    use crate::retry::ErrorKind;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use warden_common::RunStatus;

    /// Agents block on `gate` until the test releases permits.
    struct GatedDispatcher {
        gate: Arc<Semaphore>,
        fail_recon: bool,
    }

    #[async_trait]
    impl ActivityDispatcher for GatedDispatcher {
        async fn run_agent(&self, agent: AgentName) -> Result<AgentOutcome, ExecutorError> {
            self.gate.acquire().await.unwrap().forget();
            if self.fail_recon && agent == AgentName::Recon {
                return Err(ExecutorError::NonRetryable {
                    agent: agent.to_string(),
                    attempt: 1,
                    kind: ErrorKind::Permission,
                    source: AgentError::Execution("permission denied".to_string()),
                });
            }
            Ok(AgentOutcome::default())
        }

        async fn check_queue(&self, class: VulnClass) -> anyhow::Result<QueueDecision> {
            Ok(QueueDecision {
                should_exploit: false,
                vulnerability_count: 0,
                class,
            })
        }

        async fn assemble_report(&self, _classes: &[VulnClass]) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    fn orchestrator(gate: Arc<Semaphore>, fail_recon: bool) -> Orchestrator {
        Orchestrator::new(
            PipelinePlan::standard(&[VulnClass::Xss]),
            Arc::new(GatedDispatcher { gate, fail_recon }),
        )
    }

    async fn wait_for_progress(registry: &RunRegistry, run_id: &str) -> RunSnapshot {
        for _ in 0..200 {
            if let Ok(snapshot) = registry.get_progress(run_id).await {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {} never published progress", run_id);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let registry = RunRegistry::new();
        assert_eq!(
            registry.get_progress("missing").await,
            Err(QueryError::NotFound("missing".to_string()))
        );
        assert!(matches!(
            registry.describe("missing").await,
            Err(QueryError::NotFound(_))
        ));
        assert!(registry.cancel("missing").is_err());
    }

    #[tokio::test]
    async fn test_completed_run_agrees_in_both_views() {
        let registry = RunRegistry::new();
        let gate = Arc::new(Semaphore::new(100));
        let handle = registry.start("run-ok", orchestrator(gate, false)).unwrap();

        let finished = handle.wait().await.unwrap();
        assert_eq!(finished.description.status, WorkflowStatus::Completed);
        assert!(finished.description.close_time.is_some());
        assert!(finished.error.is_none());
        assert_eq!(finished.snapshot.unwrap().status, RunStatus::Completed);

        let progress = registry.get_progress("run-ok").await.unwrap();
        assert_eq!(progress.status, RunStatus::Completed);
        let description = registry.describe("run-ok").await.unwrap();
        assert_eq!(description.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_run_reports_failed() {
        let registry = RunRegistry::new();
        let gate = Arc::new(Semaphore::new(100));
        let handle = registry.start("run-bad", orchestrator(gate, true)).unwrap();

        let finished = handle.wait().await.unwrap();
        assert_eq!(finished.description.status, WorkflowStatus::Failed);
        assert!(finished.error.unwrap().contains("permission denied"));
        let snapshot = finished.snapshot.unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.failed_agent.as_deref(), Some("recon"));
    }

    #[tokio::test]
    async fn test_duplicate_run_id_is_rejected() {
        let registry = RunRegistry::new();
        let gate = Arc::new(Semaphore::new(0));
        let _handle = registry.start("run-dup", orchestrator(gate.clone(), false)).unwrap();
        assert!(registry.start("run-dup", orchestrator(gate, false)).is_err());
    }

    #[tokio::test]
    async fn test_query_is_idempotent_while_running() {
        let registry = RunRegistry::new();
        let gate = Arc::new(Semaphore::new(0));
        let handle = registry.start("run-q", orchestrator(gate, false)).unwrap();

        let first = wait_for_progress(&registry, "run-q").await;
        let second = registry.get_progress("run-q").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(handle.query(), Some(second));
    }

    #[tokio::test]
    async fn test_cancel_leaves_stale_progress_but_terminates_status() {
        let registry = RunRegistry::new();
        let gate = Arc::new(Semaphore::new(0));
        let handle = registry.start("run-c", orchestrator(gate, false)).unwrap();
        wait_for_progress(&registry, "run-c").await;

        assert!(registry.cancel("run-c").unwrap());
        let finished = handle.wait().await.unwrap();
        assert_eq!(finished.description.status, WorkflowStatus::Terminated);

        // The query view never learned about the termination.
        let progress = registry.get_progress("run-c").await.unwrap();
        assert_eq!(progress.status, RunStatus::Running);
        let description = registry.describe("run-c").await.unwrap();
        assert_eq!(description.status, WorkflowStatus::Terminated);

        assert!(!registry.cancel("run-c").unwrap());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_runs_are_evicted_after_retention() {
        let registry = RunRegistry::new();
        let gate = Arc::new(Semaphore::new(100));
        registry
            .start("run-old", orchestrator(gate.clone(), false))
            .unwrap()
            .wait()
            .await
            .unwrap();
        let blocked = Arc::new(Semaphore::new(0));
        let _live = registry.start("run-live", orchestrator(blocked, false)).unwrap();

        let retention = chrono::Duration::seconds(CLOSED_RUN_RETENTION_SECS);
        assert_eq!(registry.prune_closed(Utc::now(), retention), 0);
        assert!(registry.contains("run-old"));

        let later = Utc::now() + retention + chrono::Duration::seconds(1);
        assert_eq!(registry.prune_closed(later, retention), 1);
        assert!(!registry.contains("run-old"));
        assert!(registry.contains("run-live"));
        assert!(matches!(
            registry.describe("run-old").await,
            Err(QueryError::NotFound(_))
        ));
    }
}
