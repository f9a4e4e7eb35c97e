use chrono::{DateTime, Utc};
use tokio::sync::watch;
use warden_common::{AgentMetrics, RunSnapshot, RunStatus, RunSummary};

/// The live run record.
///
/// Only the orchestrator's own execution path holds a `RunState`; everyone else
/// reads the copies it publishes on the watch channel. A run that reached a
/// terminal status ignores further mutation.
pub struct RunState {
    snapshot: RunSnapshot,
    tx: watch::Sender<Option<RunSnapshot>>,
}

impl RunState {
    /// Initialize the record and publish it.
    pub fn new(run_id: &str, start_time: DateTime<Utc>, tx: watch::Sender<Option<RunSnapshot>>) -> Self {
        let state = Self {
            snapshot: RunSnapshot::new(run_id, start_time),
            tx,
        };
        state.publish();
        state
    }

    /// A state with its own channel, for callers that only need the receiver.
    pub fn detached(
        run_id: &str,
        start_time: DateTime<Utc>,
    ) -> (Self, watch::Receiver<Option<RunSnapshot>>) {
        let (tx, rx) = watch::channel(None);
        (Self::new(run_id, start_time, tx), rx)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.snapshot.run_id
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshot.is_terminal()
    }

    pub fn phase_started(&mut self, phase: &str) {
        self.mutate(|s| {
            s.current_phase = Some(phase.to_string());
            s.current_agent = None;
        });
    }

    pub fn agent_started(&mut self, agent: &str) {
        self.mutate(|s| s.current_agent = Some(agent.to_string()));
    }

    /// Record a finished agent. Completion order is kept; repeats are ignored.
    pub fn agent_completed(&mut self, agent: &str, metrics: AgentMetrics) {
        self.mutate(|s| {
            if !s.completed_agents.iter().any(|a| a == agent) {
                s.completed_agents.push(agent.to_string());
            }
            s.agent_metrics.insert(agent.to_string(), metrics);
            if s.current_agent.as_deref() == Some(agent) {
                s.current_agent = None;
            }
        });
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.mutate(|s| {
            s.status = RunStatus::Completed;
            s.current_agent = None;
            s.summary = Some(RunSummary::compute(s, now));
        });
    }

    /// Mark the run failed at `agent` (or at the current agent when `None`).
    pub fn fail(&mut self, agent: Option<&str>, error: &str, now: DateTime<Utc>) {
        self.mutate(|s| {
            s.status = RunStatus::Failed;
            s.failed_agent = agent.map(String::from).or_else(|| s.current_agent.clone());
            s.error = Some(error.to_string());
            s.summary = Some(RunSummary::compute(s, now));
        });
    }

    fn mutate(&mut self, f: impl FnOnce(&mut RunSnapshot)) {
        if self.snapshot.is_terminal() {
            tracing::warn!(run_id = %self.snapshot.run_id, "ignoring update to a finished run");
            return;
        }
        f(&mut self.snapshot);
        self.publish();
    }

    fn publish(&self) {
        debug_assert!(
            self.snapshot.holds_invariants(),
            "run record invariants violated: {:?}",
            self.snapshot
        );
        self.tx.send_replace(Some(self.snapshot.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn metrics(cost: Option<f64>, turns: Option<u32>) -> AgentMetrics {
        AgentMetrics {
            duration_ms: 10,
            cost_usd: cost,
            num_turns: turns,
            model: None,
        }
    }

    #[test]
    fn test_initial_state_is_published() {
        let (state, rx) = RunState::detached("run-1", Utc::now());
        let published = rx.borrow().clone().unwrap();
        assert_eq!(published, state.snapshot());
        assert_eq!(published.status, RunStatus::Running);
        assert!(published.summary.is_none());
        assert!(published.completed_agents.is_empty());
    }

    #[test]
    fn test_ordered_agent_lifecycle() {
        let (mut state, rx) = RunState::detached("run-1", Utc::now());
        state.phase_started("pre-reconnaissance");
        state.agent_started("pre-recon");
        {
            let s = rx.borrow();
            let s = s.as_ref().unwrap();
            assert_eq!(s.current_phase.as_deref(), Some("pre-reconnaissance"));
            assert_eq!(s.current_agent.as_deref(), Some("pre-recon"));
        }

        state.agent_completed("pre-recon", metrics(Some(1.0), Some(3)));
        let s = rx.borrow().clone().unwrap();
        assert_eq!(s.completed_agents, vec!["pre-recon"]);
        assert!(s.current_agent.is_none());
        assert_eq!(s.agent_metrics["pre-recon"].num_turns, Some(3));
    }

    #[test]
    fn test_completed_agents_are_unique() {
        let (mut state, _rx) = RunState::detached("run-1", Utc::now());
        state.agent_completed("recon", metrics(None, None));
        state.agent_completed("recon", metrics(Some(2.0), None));
        let s = state.snapshot();
        assert_eq!(s.completed_agents, vec!["recon"]);
        assert_eq!(s.agent_metrics["recon"].cost_usd, Some(2.0));
    }

    #[test]
    fn test_complete_computes_summary() {
        let start = Utc::now();
        let (mut state, rx) = RunState::detached("run-1", start);
        state.agent_completed("pre-recon", metrics(Some(1.5), Some(2)));
        state.agent_completed("recon", metrics(None, Some(3)));
        state.complete(start + Duration::milliseconds(900));

        let s = rx.borrow().clone().unwrap();
        assert_eq!(s.status, RunStatus::Completed);
        let summary = s.summary.unwrap();
        assert_eq!(summary.total_cost_usd, 1.5);
        assert_eq!(summary.total_turns, 5);
        assert_eq!(summary.total_duration_ms, 900);
        assert_eq!(summary.agent_count, 2);
    }

    #[test]
    fn test_fail_keeps_partial_progress() {
        let (mut state, _rx) = RunState::detached("run-1", Utc::now());
        state.agent_completed("pre-recon", metrics(Some(1.0), None));
        state.phase_started("reconnaissance");
        state.agent_started("recon");
        state.fail(None, "invalid api key", Utc::now());

        let s = state.snapshot();
        assert_eq!(s.status, RunStatus::Failed);
        assert_eq!(s.failed_agent.as_deref(), Some("recon"));
        assert_eq!(s.error.as_deref(), Some("invalid api key"));
        assert_eq!(s.completed_agents, vec!["pre-recon"]);
        assert!(s.summary.is_some());
        assert!(s.holds_invariants());
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let (mut state, rx) = RunState::detached("run-1", Utc::now());
        state.complete(Utc::now());
        let before = rx.borrow().clone();

        state.phase_started("reporting");
        state.agent_completed("report", metrics(None, None));
        state.fail(Some("report"), "late failure", Utc::now());

        assert_eq!(*rx.borrow(), before);
        assert_eq!(state.snapshot().status, RunStatus::Completed);
    }

    #[test]
    fn test_repeated_reads_are_equal() {
        let (mut state, rx) = RunState::detached("run-1", Utc::now());
        state.phase_started("reconnaissance");
        let first = rx.borrow().clone();
        let second = rx.borrow().clone();
        assert_eq!(first, second);
    }
}
