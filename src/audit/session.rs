use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use warden_common::{AgentMetrics, RunSnapshot, RunStatus, RunSummary};

use super::log::AppendLog;
use super::mutex::SessionMutex;
use crate::agents::{QueueDecision, RunContext};
use crate::retry::{AttemptObserver, AttemptReport, ErrorKind, VALIDATION_FAILED};

const WORKFLOW_LOG: &str = "workflow.log";
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Run,
    Phase,
    Agent,
    Attempt,
    Retry,
    Validation,
    Gate,
    Summary,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Phase => "PHASE",
            Self::Agent => "AGENT",
            Self::Attempt => "ATTEMPT",
            Self::Retry => "RETRY",
            Self::Validation => "VALIDATION",
            Self::Gate => "GATE",
            Self::Summary => "SUMMARY",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Render one workflow.log line.
pub fn format_line(at: DateTime<Utc>, kind: EventKind, message: &str) -> String {
    format!(
        "[{}] [{}] {}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        kind,
        message
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub success: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AgentMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub run_id: String,
    pub target_url: String,
    pub repo_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub agents: BTreeMap<String, AgentRecord>,
    pub summary: Option<RunSummary>,
}

/// Audit trail of one run: the append-only workflow log plus session metadata.
///
/// All writes for a run go through the session mutex, so lines from parallel
/// agents never interleave with a half-written `session.json`.
pub struct AuditSession {
    run_id: String,
    dir: PathBuf,
    log: AppendLog,
    mutex: SessionMutex,
    metadata: Mutex<SessionMetadata>,
}

impl AuditSession {
    pub fn workflow_log_path(audit_dir: &Path, run_id: &str) -> PathBuf {
        audit_dir.join(run_id).join(WORKFLOW_LOG)
    }

    /// Create (or reopen) the session directory and log the run start.
    pub async fn start(audit_dir: &Path, ctx: &RunContext, mutex: SessionMutex) -> Result<Self> {
        let dir = audit_dir.join(&ctx.run_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create audit dir {}", dir.display()))?;

        let log = AppendLog::new(&dir.join(WORKFLOW_LOG));
        let started_at = Utc::now();
        log.init(&format!(
            "# warden workflow log\n# run: {}\n# target: {}\n# repo: {}",
            ctx.run_id,
            ctx.target_url,
            ctx.repo_path.display()
        ))?;

        let session = Self {
            run_id: ctx.run_id.clone(),
            dir,
            log,
            mutex,
            metadata: Mutex::new(SessionMetadata {
                run_id: ctx.run_id.clone(),
                target_url: ctx.target_url.clone(),
                repo_path: ctx.repo_path.clone(),
                started_at,
                ended_at: None,
                status: RunStatus::Running,
                agents: BTreeMap::new(),
                summary: None,
            }),
        };

        session
            .record(EventKind::Run, format!("run {} started", ctx.run_id), |_| {})
            .await?;
        Ok(session)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn session_file(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    pub fn metadata(&self) -> Result<SessionMetadata> {
        let meta = self
            .metadata
            .lock()
            .map_err(|_| anyhow::anyhow!("session metadata lock poisoned"))?;
        Ok(meta.clone())
    }

    /// Append a line to the workflow log without touching session metadata.
    pub async fn log_event(&self, kind: EventKind, message: &str) -> Result<()> {
        let line = format_line(Utc::now(), kind, message);
        self.mutex
            .with_lock(&self.run_id, || async { self.log.append(&line) })
            .await
    }

    pub async fn phase_started(&self, phase: &str) -> Result<()> {
        self.log_event(EventKind::Phase, &format!("{} started", phase))
            .await
    }

    pub async fn agent_completed(&self, agent: &str, metrics: &AgentMetrics) -> Result<()> {
        let cost = metrics
            .cost_usd
            .map(|c| format!("${:.4}", c))
            .unwrap_or_else(|| "n/a".to_string());
        let message = format!(
            "{} completed in {}ms (cost {})",
            agent, metrics.duration_ms, cost
        );
        let agent_key = agent.to_string();
        let metrics = metrics.clone();
        self.record(EventKind::Agent, message, move |meta| {
            meta.agents.entry(agent_key).or_default().metrics = Some(metrics);
        })
        .await
    }

    pub async fn agent_failed(&self, agent: &str, error: &str) -> Result<()> {
        let agent_key = agent.to_string();
        let error = error.to_string();
        self.record(
            EventKind::Agent,
            format!("{} failed: {}", agent, error),
            move |meta| {
                meta.agents.entry(agent_key).or_default().error = Some(error);
            },
        )
        .await
    }

    pub async fn gate(&self, decision: &QueueDecision) -> Result<()> {
        let verdict = if decision.should_exploit {
            "exploit"
        } else {
            "skip"
        };
        self.log_event(
            EventKind::Gate,
            &format!(
                "{} queue: {} vulnerabilities, {}",
                decision.class, decision.vulnerability_count, verdict
            ),
        )
        .await
    }

    /// Record the terminal snapshot: status, end time and summary.
    pub async fn finish(&self, snapshot: &RunSnapshot) -> Result<()> {
        let message = match &snapshot.summary {
            Some(s) => format!(
                "run {} {}: {} agents, {} turns, ${:.4}, {}ms",
                snapshot.run_id,
                snapshot.status,
                s.agent_count,
                s.total_turns,
                s.total_cost_usd,
                s.total_duration_ms
            ),
            None => format!("run {} {}", snapshot.run_id, snapshot.status),
        };
        let status = snapshot.status;
        let summary = snapshot.summary.clone();
        self.record(EventKind::Summary, message, move |meta| {
            meta.status = status;
            meta.ended_at = Some(Utc::now());
            meta.summary = summary;
        })
        .await
    }

    /// Append a line and rewrite `session.json` under the session lock.
    async fn record<F>(&self, kind: EventKind, message: String, update: F) -> Result<()>
    where
        F: FnOnce(&mut SessionMetadata) + Send,
    {
        self.mutex
            .with_lock(&self.run_id, move || async move {
                self.log.append(&format_line(Utc::now(), kind, &message))?;

                let json = {
                    let mut meta = self
                        .metadata
                        .lock()
                        .map_err(|_| anyhow::anyhow!("session metadata lock poisoned"))?;
                    update(&mut *meta);
                    serde_json::to_string_pretty(&*meta)
                        .context("Failed to serialize session metadata")?
                };
                self.write_session_file(&json)
            })
            .await
    }

    fn write_session_file(&self, json: &str) -> Result<()> {
        let path = self.session_file();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))
    }
}

#[async_trait]
impl AttemptObserver for AuditSession {
    async fn attempt_started(&self, agent: &str, attempt: u32) {
        let agent_key = agent.to_string();
        let result = self
            .record(
                EventKind::Attempt,
                format!("{} attempt {} started", agent, attempt),
                move |meta| {
                    meta.agents
                        .entry(agent_key)
                        .or_default()
                        .attempts
                        .push(AttemptRecord {
                            attempt,
                            started_at: Utc::now(),
                            duration_ms: None,
                            cost_usd: None,
                            success: None,
                            error: None,
                        });
                },
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(run_id = %self.run_id, agent, attempt, error = %e, "failed to audit attempt start");
        }
    }

    async fn attempt_finished(&self, report: &AttemptReport) {
        let (kind, message) = match (&report.error, report.success) {
            (_, true) => (
                EventKind::Attempt,
                format!(
                    "{} attempt {} succeeded in {}ms",
                    report.agent, report.attempt, report.duration_ms
                ),
            ),
            (Some(err), false) if err == VALIDATION_FAILED => (
                EventKind::Validation,
                format!(
                    "{} attempt {}: {}",
                    report.agent, report.attempt, VALIDATION_FAILED
                ),
            ),
            (err, false) => (
                EventKind::Attempt,
                format!(
                    "{} attempt {} failed after {}ms: {}",
                    report.agent,
                    report.attempt,
                    report.duration_ms,
                    err.as_deref().unwrap_or("unknown error")
                ),
            ),
        };

        let finished = report.clone();
        let result = self
            .record(kind, message, move |meta| {
                let record = meta.agents.entry(finished.agent.clone()).or_default();
                if let Some(entry) = record
                    .attempts
                    .iter_mut()
                    .rev()
                    .find(|a| a.attempt == finished.attempt)
                {
                    entry.duration_ms = Some(finished.duration_ms);
                    entry.cost_usd = finished.cost_usd;
                    entry.success = Some(finished.success);
                    entry.error = finished.error;
                }
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(run_id = %self.run_id, agent = %report.agent, error = %e, "failed to audit attempt end");
        }
    }

    async fn retry_scheduled(&self, agent: &str, attempt: u32, kind: ErrorKind, delay: Duration) {
        let message = format!(
            "{} attempt {} failed ({}), retrying in {}ms",
            agent,
            attempt,
            kind,
            delay.as_millis()
        );
        if let Err(e) = self.log_event(EventKind::Retry, &message).await {
            tracing::warn!(run_id = %self.run_id, agent, error = %e, "failed to audit retry");
        }
    }
}
