//! Walks a [`PipelinePlan`] over a [`RunState`].
//!
//! Ordered phases run one agent at a time and fail the whole run when that
//! agent fails. The parallel phase spawns one sub-pipeline per class on a
//! `JoinSet`; a sub-pipeline that fails is recorded and logged, its siblings
//! keep going, and the next phase starts once every branch has settled.
//!
//! Sub-pipelines never touch the run record directly. They report agent
//! starts and completions over a channel and the orchestrator applies them on
//! its own path.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use warden_common::{AgentMetrics, RunSnapshot};

use super::dispatch::ActivityDispatcher;
use super::phase::{Phase, PipelinePlan};
use super::state::RunState;
use crate::agents::{AgentName, VulnClass};
use crate::errors::OrchestratorError;

/// How one exploitation sub-pipeline ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubPipelineOutcome {
    /// The gate found vulnerabilities and the exploit agent ran.
    Exploited {
        class: VulnClass,
        vulnerability_count: usize,
    },
    /// The gate found nothing to exploit.
    Skipped { class: VulnClass },
    /// An agent or the gate failed; siblings were unaffected.
    Failed {
        class: VulnClass,
        agent: String,
        error: String,
    },
}

impl SubPipelineOutcome {
    pub fn class(&self) -> VulnClass {
        match self {
            Self::Exploited { class, .. } | Self::Skipped { class } | Self::Failed { class, .. } => {
                *class
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Result of a run that reached `completed`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub snapshot: RunSnapshot,
    pub sub_pipelines: Vec<SubPipelineOutcome>,
}

/// Progress reported by a sub-pipeline task.
#[derive(Debug)]
enum UnitEvent {
    Started { agent: String },
    Completed { agent: String, metrics: AgentMetrics },
}

pub struct Orchestrator {
    plan: PipelinePlan,
    dispatcher: Arc<dyn ActivityDispatcher>,
}

impl Orchestrator {
    pub fn new(plan: PipelinePlan, dispatcher: Arc<dyn ActivityDispatcher>) -> Self {
        Self { plan, dispatcher }
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    /// Execute every phase in order.
    ///
    /// On failure the record is already terminal (failed agent, error, summary)
    /// and the run-finished notification has gone out before the error returns.
    pub async fn run(&self, state: &mut RunState) -> Result<RunOutcome, OrchestratorError> {
        let run_id = state.run_id().to_string();
        tracing::info!(run_id = %run_id, phases = self.plan.phases().len(), "run started");

        let mut sub_pipelines = Vec::new();
        for phase in self.plan.phases() {
            state.phase_started(phase.name());
            self.dispatcher.phase_started(phase.name()).await;
            tracing::info!(run_id = %run_id, phase = phase.name(), "phase started");

            match phase {
                Phase::Ordered { agent, .. } => self.run_ordered(state, *agent).await?,
                Phase::Parallel { classes, .. } => {
                    sub_pipelines.extend(self.run_parallel(state, classes).await);
                }
            }
        }

        state.complete(Utc::now());
        let snapshot = state.snapshot();
        self.dispatcher.run_finished(&snapshot).await;
        tracing::info!(
            run_id = %run_id,
            agents = snapshot.completed_agents.len(),
            failed_sub_pipelines = sub_pipelines.iter().filter(|s| s.is_failed()).count(),
            "run completed"
        );

        Ok(RunOutcome {
            snapshot,
            sub_pipelines,
        })
    }

    async fn run_ordered(&self, state: &mut RunState, agent: AgentName) -> Result<(), OrchestratorError> {
        let name = agent.to_string();

        if agent == AgentName::Report {
            let classes = self.plan.classes();
            if let Err(e) = self.dispatcher.assemble_report(&classes).await {
                let err = OrchestratorError::Dispatch(format!("report assembly failed: {:#}", e));
                return Err(self.fail(state, &name, err).await);
            }
        }

        state.agent_started(&name);
        match self.dispatcher.run_agent(agent).await {
            Ok(outcome) => {
                let metrics = outcome.metrics();
                state.agent_completed(&name, metrics.clone());
                self.dispatcher.agent_completed(&name, &metrics).await;
                Ok(())
            }
            Err(source) => {
                let err = OrchestratorError::AgentFailed {
                    agent: name.clone(),
                    source,
                };
                Err(self.fail(state, &name, err).await)
            }
        }
    }

    /// Record a run-fatal error and hand it back for propagation.
    async fn fail(&self, state: &mut RunState, agent: &str, err: OrchestratorError) -> OrchestratorError {
        let message = err.to_string();
        tracing::error!(run_id = %state.run_id(), agent, error = %message, "run failed");

        state.fail(Some(agent), &message, Utc::now());
        self.dispatcher.agent_failed(agent, &message).await;
        self.dispatcher.run_finished(&state.snapshot()).await;
        err
    }

    /// Fan out one sub-pipeline per class and wait for all of them to settle.
    async fn run_parallel(&self, state: &mut RunState, classes: &[VulnClass]) -> Vec<SubPipelineOutcome> {
        let (events_tx, mut events_rx) = mpsc::channel::<UnitEvent>(64);
        let mut set = JoinSet::new();
        let mut classes_by_task = HashMap::new();

        for &class in classes {
            let dispatcher = self.dispatcher.clone();
            let events = events_tx.clone();
            let handle = set.spawn(run_sub_pipeline(dispatcher, class, events));
            classes_by_task.insert(handle.id(), class);
        }
        drop(events_tx);

        let mut outcomes = Vec::with_capacity(classes.len());
        loop {
            tokio::select! {
                biased;

                Some(event) = events_rx.recv() => apply_event(state, event),

                joined = set.join_next_with_id() => match joined {
                    Some(Ok((_, outcome))) => outcomes.push(outcome),
                    Some(Err(join_err)) => {
                        let class = classes_by_task.get(&join_err.id()).copied();
                        tracing::error!(run_id = %state.run_id(), class = ?class, error = %join_err, "sub-pipeline task aborted");
                        if let Some(class) = class {
                            outcomes.push(SubPipelineOutcome::Failed {
                                class,
                                agent: AgentName::Vuln(class).to_string(),
                                error: format!("sub-pipeline task aborted: {}", join_err),
                            });
                        }
                    }
                    None => break,
                },
            }
        }
        while let Ok(event) = events_rx.try_recv() {
            apply_event(state, event);
        }

        for outcome in &outcomes {
            if let SubPipelineOutcome::Failed { class, agent, error } = outcome {
                tracing::warn!(run_id = %state.run_id(), %class, %agent, %error, "sub-pipeline failed");
                self.dispatcher.agent_failed(agent, error).await;
            }
        }
        outcomes
    }
}

fn apply_event(state: &mut RunState, event: UnitEvent) {
    match event {
        UnitEvent::Started { agent } => state.agent_started(&agent),
        UnitEvent::Completed { agent, metrics } => state.agent_completed(&agent, metrics),
    }
}

/// `<class>-vuln`, then the queue gate, then `<class>-exploit` if the gate says so.
async fn run_sub_pipeline(
    dispatcher: Arc<dyn ActivityDispatcher>,
    class: VulnClass,
    events: mpsc::Sender<UnitEvent>,
) -> SubPipelineOutcome {
    let vuln = AgentName::Vuln(class);
    if let Err(error) = run_unit(dispatcher.as_ref(), vuln, &events).await {
        return SubPipelineOutcome::Failed {
            class,
            agent: vuln.to_string(),
            error,
        };
    }

    let decision = match dispatcher.check_queue(class).await {
        Ok(decision) => decision,
        Err(e) => {
            let err = OrchestratorError::Gating {
                class: class.to_string(),
                message: format!("{:#}", e),
            };
            return SubPipelineOutcome::Failed {
                class,
                agent: vuln.to_string(),
                error: err.to_string(),
            };
        }
    };
    dispatcher.gate_decided(&decision).await;
    tracing::info!(%class, vulnerabilities = decision.vulnerability_count, exploit = decision.should_exploit, "exploitation gate");

    if !decision.should_exploit {
        return SubPipelineOutcome::Skipped { class };
    }

    let exploit = AgentName::Exploit(class);
    if let Err(error) = run_unit(dispatcher.as_ref(), exploit, &events).await {
        return SubPipelineOutcome::Failed {
            class,
            agent: exploit.to_string(),
            error,
        };
    }

    SubPipelineOutcome::Exploited {
        class,
        vulnerability_count: decision.vulnerability_count,
    }
}

async fn run_unit(
    dispatcher: &dyn ActivityDispatcher,
    agent: AgentName,
    events: &mpsc::Sender<UnitEvent>,
) -> Result<(), String> {
    let name = agent.to_string();
    events
        .send(UnitEvent::Started { agent: name.clone() })
        .await
        .ok();

    let outcome = dispatcher.run_agent(agent).await.map_err(|source| {
        OrchestratorError::AgentFailed {
            agent: name.clone(),
            source,
        }
        .to_string()
    })?;

    let metrics = outcome.metrics();
    dispatcher.agent_completed(&name, &metrics).await;
    events
        .send(UnitEvent::Completed {
            agent: name,
            metrics,
        })
        .await
        .ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentOutcome, QueueDecision};
    use crate::errors::{AgentError, ExecutorError};
    use crate::retry::ErrorKind;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use warden_common::RunStatus;

    /// Dispatcher whose agents succeed unless listed in `failing`.
    #[derive(Default)]
    struct FakeDispatcher {
        failing: HashSet<String>,
        empty_queues: HashSet<VulnClass>,
        broken_queues: HashSet<VulnClass>,
        delays: HashMap<String, Duration>,
        ran: Mutex<Vec<String>>,
        finished: Mutex<Vec<RunSnapshot>>,
        failures: Mutex<Vec<String>>,
        report_drafts: Mutex<usize>,
        /// Signalled when `xss-exploit` starts; `injection-vuln` waits on it.
        xss_exploit_started: Option<Arc<Notify>>,
    }

    impl FakeDispatcher {
        fn failing(agents: &[&str]) -> Self {
            Self {
                failing: agents.iter().map(|a| a.to_string()).collect(),
                ..Default::default()
            }
        }

        fn ran(&self) -> Vec<String> {
            self.ran.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActivityDispatcher for FakeDispatcher {
        async fn run_agent(&self, agent: AgentName) -> Result<AgentOutcome, ExecutorError> {
            let name = agent.to_string();
            if let Some(notify) = &self.xss_exploit_started {
                match agent {
                    AgentName::Exploit(VulnClass::Xss) => notify.notify_one(),
                    AgentName::Vuln(VulnClass::Injection) => notify.notified().await,
                    _ => {}
                }
            }
            if let Some(delay) = self.delays.get(&name) {
                tokio::time::sleep(*delay).await;
            }
            self.ran.lock().unwrap().push(name.clone());

            if self.failing.contains(&name) {
                return Err(ExecutorError::NonRetryable {
                    agent: name,
                    attempt: 1,
                    kind: ErrorKind::Authentication,
                    source: AgentError::Execution("invalid api key".to_string()),
                });
            }
            Ok(AgentOutcome {
                output: format!("{} done", name),
                duration_ms: 10,
                cost_usd: Some(0.5),
                num_turns: Some(2),
                model: None,
            })
        }

        async fn check_queue(&self, class: VulnClass) -> anyhow::Result<QueueDecision> {
            if self.broken_queues.contains(&class) {
                anyhow::bail!("Malformed exploitation queue");
            }
            let count = if self.empty_queues.contains(&class) { 0 } else { 2 };
            Ok(QueueDecision {
                should_exploit: count > 0,
                vulnerability_count: count,
                class,
            })
        }

        async fn assemble_report(&self, _classes: &[VulnClass]) -> anyhow::Result<usize> {
            *self.report_drafts.lock().unwrap() += 1;
            Ok(0)
        }

        async fn agent_failed(&self, agent: &str, _error: &str) {
            self.failures.lock().unwrap().push(agent.to_string());
        }

        async fn run_finished(&self, snapshot: &RunSnapshot) {
            self.finished.lock().unwrap().push(snapshot.clone());
        }
    }

    async fn run_with(
        dispatcher: Arc<FakeDispatcher>,
        classes: &[VulnClass],
    ) -> (Result<RunOutcome, OrchestratorError>, RunSnapshot) {
        let orchestrator = Orchestrator::new(PipelinePlan::standard(classes), dispatcher);
        let (mut state, rx) = RunState::detached("run-1", Utc::now());
        let result = orchestrator.run(&mut state).await;
        let published = rx.borrow().clone().unwrap();
        (result, published)
    }

    #[tokio::test]
    async fn test_full_run_completes() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let (result, snapshot) = run_with(dispatcher.clone(), &[VulnClass::Xss, VulnClass::Auth]).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.snapshot, snapshot);
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.completed_agents.len(), 7);
        assert_eq!(snapshot.completed_agents[0], "pre-recon");
        assert_eq!(snapshot.completed_agents[1], "recon");
        assert_eq!(snapshot.completed_agents[6], "report");
        assert!(snapshot.current_agent.is_none());
        assert_eq!(snapshot.current_phase.as_deref(), Some("reporting"));

        let summary = snapshot.summary.clone().unwrap();
        assert_eq!(summary.agent_count, 7);
        assert_eq!(summary.total_turns, 14);
        assert!((summary.total_cost_usd - 3.5).abs() < 1e-9);

        assert_eq!(*dispatcher.report_drafts.lock().unwrap(), 1);
        assert_eq!(dispatcher.finished.lock().unwrap().len(), 1);
        assert!(outcome
            .sub_pipelines
            .iter()
            .all(|s| matches!(s, SubPipelineOutcome::Exploited { vulnerability_count: 2, .. })));
    }

    #[tokio::test]
    async fn test_ordered_failure_fails_run_and_keeps_progress() {
        let dispatcher = Arc::new(FakeDispatcher::failing(&["recon"]));
        let (result, snapshot) = run_with(dispatcher.clone(), &VulnClass::ALL).await;

        let err = result.unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentFailed { ref agent, .. } if agent == "recon"));

        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.failed_agent.as_deref(), Some("recon"));
        assert!(snapshot.error.as_deref().unwrap().contains("invalid api key"));
        assert_eq!(snapshot.completed_agents, vec!["pre-recon"]);
        assert!(snapshot.summary.is_some());
        assert_eq!(snapshot.current_phase.as_deref(), Some("reconnaissance"));

        // Nothing after recon ran, and the terminal notification went out.
        assert_eq!(dispatcher.ran(), vec!["pre-recon", "recon"]);
        let finished = dispatcher.finished.lock().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_one_failed_sub_pipeline_does_not_abort_siblings() {
        let dispatcher = Arc::new(FakeDispatcher::failing(&["ssrf-vuln"]));
        let (result, snapshot) = run_with(dispatcher.clone(), &VulnClass::ALL).await;

        let outcome = result.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);

        let failed: Vec<_> = outcome.sub_pipelines.iter().filter(|s| s.is_failed()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].class(), VulnClass::Ssrf);
        assert_eq!(outcome.sub_pipelines.len(), 5);

        assert!(!snapshot.completed_agents.contains(&"ssrf-vuln".to_string()));
        assert!(!dispatcher.ran().contains(&"ssrf-exploit".to_string()));
        // 2 ordered + 4 classes * 2 + report
        assert_eq!(snapshot.completed_agents.len(), 11);
        assert!(snapshot.completed_agents.contains(&"report".to_string()));
        assert_eq!(*dispatcher.failures.lock().unwrap(), vec!["ssrf-vuln"]);
    }

    #[tokio::test]
    async fn test_gate_skips_and_gate_errors_are_isolated() {
        let dispatcher = Arc::new(FakeDispatcher {
            empty_queues: [VulnClass::Xss].into_iter().collect(),
            broken_queues: [VulnClass::Authz].into_iter().collect(),
            ..Default::default()
        });
        let (result, snapshot) =
            run_with(dispatcher.clone(), &[VulnClass::Xss, VulnClass::Authz, VulnClass::Auth]).await;

        let outcome = result.unwrap();
        let by_class: HashMap<VulnClass, &SubPipelineOutcome> =
            outcome.sub_pipelines.iter().map(|s| (s.class(), s)).collect();
        assert_eq!(
            by_class[&VulnClass::Xss],
            &SubPipelineOutcome::Skipped {
                class: VulnClass::Xss
            }
        );
        match by_class[&VulnClass::Authz] {
            SubPipelineOutcome::Failed { agent, error, .. } => {
                assert_eq!(agent, "authz-vuln");
                assert!(error.contains("Malformed exploitation queue"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(matches!(
            by_class[&VulnClass::Auth],
            SubPipelineOutcome::Exploited { .. }
        ));

        let ran = dispatcher.ran();
        assert!(!ran.contains(&"xss-exploit".to_string()));
        assert!(!ran.contains(&"authz-exploit".to_string()));
        // The vuln agent itself succeeded even though its gate failed.
        assert!(snapshot.completed_agents.contains(&"authz-vuln".to_string()));
        assert_eq!(snapshot.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_sub_pipelines_have_no_barrier() {
        // injection-vuln cannot finish until xss-exploit has started.
        let notify = Arc::new(Notify::new());
        let dispatcher = Arc::new(FakeDispatcher {
            xss_exploit_started: Some(notify),
            ..Default::default()
        });

        let (result, snapshot) = tokio::time::timeout(
            Duration::from_secs(5),
            run_with(dispatcher.clone(), &[VulnClass::Injection, VulnClass::Xss]),
        )
        .await
        .expect("sub-pipelines deadlocked on a barrier");
        result.unwrap();

        let ran = dispatcher.ran();
        let pos = |name: &str| ran.iter().position(|a| a == name).unwrap();
        assert!(pos("xss-exploit") < pos("injection-vuln"));

        // Completion order, not declaration order.
        let completed = &snapshot.completed_agents;
        let cpos = |name: &str| completed.iter().position(|a| a == name).unwrap();
        assert!(cpos("xss-vuln") < cpos("injection-vuln"));
    }

    #[tokio::test]
    async fn test_report_agent_failure_is_run_fatal() {
        let dispatcher = Arc::new(FakeDispatcher::failing(&["report"]));
        let (result, snapshot) = run_with(dispatcher, &[VulnClass::Xss]).await;

        assert!(result.is_err());
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.failed_agent.as_deref(), Some("report"));
        assert_eq!(snapshot.completed_agents.len(), 4);
    }

    #[tokio::test]
    async fn test_state_invariants_hold_after_every_publish() {
        let dispatcher = Arc::new(FakeDispatcher {
            delays: [("xss-vuln".to_string(), Duration::from_millis(5))]
                .into_iter()
                .collect(),
            ..Default::default()
        });
        let orchestrator = Orchestrator::new(PipelinePlan::standard(&VulnClass::ALL), dispatcher);
        let (mut state, mut rx) = RunState::detached("run-1", Utc::now());

        let watcher = tokio::spawn(async move {
            let mut seen = 0;
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone().unwrap();
                assert!(snapshot.holds_invariants());
                seen += 1;
                if snapshot.is_terminal() {
                    break;
                }
            }
            seen
        });

        orchestrator.run(&mut state).await.unwrap();
        assert!(watcher.await.unwrap() > 0);
    }
}
