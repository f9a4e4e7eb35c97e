//! The task-dispatch boundary between the orchestrator and the activities it
//! runs. The orchestrator only decides *what* runs next; everything with side
//! effects (agents, gate reads, report assembly, audit records) goes through
//! an [`ActivityDispatcher`].

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use warden_common::{AgentMetrics, RunSnapshot};

use crate::agents::{
    AgentAttempt, AgentName, AgentOutcome, ClaudeRunner, DeliverableValidator, QueueDecision,
    RunContext, VulnClass,
};
use crate::audit::AuditSession;
use crate::checkpoint::{GitCheckpointStore, ensure_repository};
use crate::config::RetrySettings;
use crate::errors::ExecutorError;
use crate::retry::{RetryExecutor, WorkUnit};

#[async_trait]
pub trait ActivityDispatcher: Send + Sync {
    /// Run one agent through retries, checkpoints and validation.
    async fn run_agent(&self, agent: AgentName) -> Result<AgentOutcome, ExecutorError>;

    /// Read the exploitation queue a vuln agent left behind.
    async fn check_queue(&self, class: VulnClass) -> Result<QueueDecision>;

    /// Build the report draft from whatever evidence exists. Returns the
    /// number of evidence files included.
    async fn assemble_report(&self, classes: &[VulnClass]) -> Result<usize>;

    async fn phase_started(&self, _phase: &str) {}

    async fn agent_completed(&self, _agent: &str, _metrics: &AgentMetrics) {}

    async fn agent_failed(&self, _agent: &str, _error: &str) {}

    async fn gate_decided(&self, _decision: &QueueDecision) {}

    async fn run_finished(&self, _snapshot: &RunSnapshot) {}
}

/// Runs activities in-process against a local repository.
pub struct LocalDispatcher {
    ctx: RunContext,
    runner: ClaudeRunner,
    executor: RetryExecutor,
    audit: Arc<AuditSession>,
}

impl LocalDispatcher {
    pub fn new(
        ctx: RunContext,
        runner: ClaudeRunner,
        retry: RetrySettings,
        audit: Arc<AuditSession>,
    ) -> Result<Self> {
        ensure_repository(&ctx.repo_path)?;
        let executor = RetryExecutor::new(retry, audit.clone());
        Ok(Self {
            ctx,
            runner,
            executor,
            audit,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }
}

#[async_trait]
impl ActivityDispatcher for LocalDispatcher {
    async fn run_agent(&self, agent: AgentName) -> Result<AgentOutcome, ExecutorError> {
        let name = agent.to_string();
        let runner = AgentAttempt::new(&self.runner, agent, &self.ctx);
        let validator = DeliverableValidator::new(&self.ctx.repo_path, agent);
        let checkpoints = GitCheckpointStore::scoped(&self.ctx.repo_path, agent.checkpoint_scope());

        self.executor
            .execute(&WorkUnit {
                name: &name,
                runner: &runner,
                validator: &validator,
                checkpoints: &checkpoints,
            })
            .await
    }

    async fn check_queue(&self, class: VulnClass) -> Result<QueueDecision> {
        crate::agents::check_queue(&self.ctx.repo_path, class)
    }

    async fn assemble_report(&self, classes: &[VulnClass]) -> Result<usize> {
        let (path, sections) = crate::agents::assemble_report(&self.ctx.repo_path, classes)?;
        tracing::info!(run_id = %self.ctx.run_id, path = %path.display(), sections, "report draft assembled");
        Ok(sections)
    }

    async fn phase_started(&self, phase: &str) {
        if let Err(e) = self.audit.phase_started(phase).await {
            tracing::warn!(run_id = %self.ctx.run_id, phase, error = %e, "failed to audit phase");
        }
    }

    async fn agent_completed(&self, agent: &str, metrics: &AgentMetrics) {
        if let Err(e) = self.audit.agent_completed(agent, metrics).await {
            tracing::warn!(run_id = %self.ctx.run_id, agent, error = %e, "failed to audit agent");
        }
    }

    async fn agent_failed(&self, agent: &str, error: &str) {
        if let Err(e) = self.audit.agent_failed(agent, error).await {
            tracing::warn!(run_id = %self.ctx.run_id, agent, error = %e, "failed to audit agent");
        }
    }

    async fn gate_decided(&self, decision: &QueueDecision) {
        if let Err(e) = self.audit.gate(decision).await {
            tracing::warn!(run_id = %self.ctx.run_id, class = %decision.class, error = %e, "failed to audit gate");
        }
    }

    async fn run_finished(&self, snapshot: &RunSnapshot) {
        if let Err(e) = self.audit.finish(snapshot).await {
            tracing::warn!(run_id = %self.ctx.run_id, error = %e, "failed to audit run summary");
        }
    }
}
