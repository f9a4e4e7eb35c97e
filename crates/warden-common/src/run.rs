//! Run-state record and authoritative status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of a run as seen through the progress query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics recorded for one completed agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub duration_ms: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Totals computed when a run reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub total_turns: u32,
    pub agent_count: usize,
}

impl RunSummary {
    /// Sum per-agent metrics. Missing cost or turn counts count as zero.
    pub fn compute(snapshot: &RunSnapshot, now: DateTime<Utc>) -> Self {
        let total_cost_usd = snapshot
            .agent_metrics
            .values()
            .map(|m| m.cost_usd.unwrap_or(0.0))
            .sum();
        let total_turns = snapshot
            .agent_metrics
            .values()
            .map(|m| m.num_turns.unwrap_or(0))
            .sum();
        let total_duration_ms = (now - snapshot.start_time).num_milliseconds().max(0) as u64;

        Self {
            total_cost_usd,
            total_duration_ms,
            total_turns,
            agent_count: snapshot.completed_agents.len(),
        }
    }
}

/// Immutable copy of a run's progress record.
///
/// Field names serialize in camelCase (`completedAgents`, `currentPhase`, ...) so
/// browser observers can consume the payload directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub current_agent: Option<String>,
    #[serde(default)]
    pub completed_agents: Vec<String>,
    #[serde(default)]
    pub failed_agent: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub agent_metrics: BTreeMap<String, AgentMetrics>,
    #[serde(default)]
    pub summary: Option<RunSummary>,
}

impl RunSnapshot {
    /// A freshly started run: running, nothing completed.
    pub fn new(run_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            current_phase: None,
            current_agent: None,
            completed_agents: Vec::new(),
            failed_agent: None,
            error: None,
            start_time,
            agent_metrics: BTreeMap::new(),
            summary: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `summary` is present iff the run is terminal, and no agent is listed twice.
    pub fn holds_invariants(&self) -> bool {
        let summary_matches = self.summary.is_some() == self.status.is_terminal();
        let mut seen = std::collections::HashSet::new();
        let unique = self.completed_agents.iter().all(|a| seen.insert(a.as_str()));
        summary_matches && unique
    }
}

/// Ground-truth lifecycle state reported by whatever executes the run.
///
/// This is deliberately richer than [`RunStatus`]: a run can be terminated or
/// cancelled from outside without the progress record ever learning about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    Cancelled,
    TimedOut,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Collapse onto the progress-record status.
    pub fn as_run_status(&self) -> RunStatus {
        match self {
            Self::Running => RunStatus::Running,
            Self::Completed => RunStatus::Completed,
            Self::Failed | Self::Terminated | Self::Cancelled | Self::TimedOut => {
                RunStatus::Failed
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer of the authoritative status source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDescription {
    pub run_id: String,
    pub status: WorkflowStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
}
