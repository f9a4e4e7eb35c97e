//! Runs one unit of work to success or exhaustion.
//!
//! Every attempt is bracketed by a checkpoint: created before the runner starts,
//! committed when the output validates, rolled back otherwise. Failures are
//! classified to decide between retrying with backoff and giving up at once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::classify::{ErrorKind, VALIDATION_FAILED, backoff_delay, classify};
use crate::agents::AgentOutcome;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::RetrySettings;
use crate::errors::{AgentError, ExecutorError};

/// Single-attempt runner for a unit of work.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    async fn run(&self, attempt: u32) -> Result<AgentOutcome, AgentError>;
}

/// Predicate over a successful attempt's result and the workspace it left.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, outcome: &AgentOutcome) -> anyhow::Result<bool>;
}

/// End-of-attempt record handed to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub agent: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub success: bool,
    pub error: Option<String>,
}

/// Receives attempt-boundary events. Observers must not fail the attempt.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn attempt_started(&self, agent: &str, attempt: u32);

    async fn attempt_finished(&self, report: &AttemptReport);

    async fn retry_scheduled(&self, _agent: &str, _attempt: u32, _kind: ErrorKind, _delay: Duration) {
    }
}

pub struct NoopObserver;

#[async_trait]
impl AttemptObserver for NoopObserver {
    async fn attempt_started(&self, _agent: &str, _attempt: u32) {}

    async fn attempt_finished(&self, _report: &AttemptReport) {}
}

/// One named unit with the collaborators it runs against.
pub struct WorkUnit<'a> {
    pub name: &'a str,
    pub runner: &'a dyn UnitRunner,
    pub validator: &'a dyn Validator,
    pub checkpoints: &'a dyn CheckpointStore,
}

pub struct RetryExecutor {
    settings: RetrySettings,
    observer: Arc<dyn AttemptObserver>,
}

impl RetryExecutor {
    pub fn new(settings: RetrySettings, observer: Arc<dyn AttemptObserver>) -> Self {
        Self { settings, observer }
    }

    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts.max(1)
    }

    pub async fn execute(&self, unit: &WorkUnit<'_>) -> Result<AgentOutcome, ExecutorError> {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let checkpoint = unit
                .checkpoints
                .create(unit.name, attempt)
                .await
                .map_err(|source| ExecutorError::Checkpoint {
                    agent: unit.name.to_string(),
                    source,
                })?;

            self.observer.attempt_started(unit.name, attempt).await;
            let started = Instant::now();
            let result = unit.runner.run(attempt).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (kind, source) = match result {
                Ok(outcome) => {
                    let valid = match unit.validator.validate(&outcome).await {
                        Ok(valid) => valid,
                        Err(source) => {
                            self.observer
                                .attempt_finished(&AttemptReport {
                                    agent: unit.name.to_string(),
                                    attempt,
                                    duration_ms: outcome.duration_ms,
                                    cost_usd: outcome.cost_usd,
                                    success: false,
                                    error: Some(format!("validator error: {:#}", source)),
                                })
                                .await;
                            self.rollback(&checkpoint, unit).await;
                            return Err(ExecutorError::Validator {
                                agent: unit.name.to_string(),
                                source,
                            });
                        }
                    };

                    self.observer
                        .attempt_finished(&AttemptReport {
                            agent: unit.name.to_string(),
                            attempt,
                            duration_ms: outcome.duration_ms,
                            cost_usd: outcome.cost_usd,
                            success: valid,
                            error: (!valid).then(|| VALIDATION_FAILED.to_string()),
                        })
                        .await;

                    if valid {
                        match unit.checkpoints.commit(&checkpoint).await {
                            Ok(id) => {
                                tracing::debug!(agent = unit.name, attempt, commit = %id, "attempt committed")
                            }
                            Err(e) => {
                                tracing::warn!(agent = unit.name, attempt, error = %e, "failed to commit checkpoint")
                            }
                        }
                        return Ok(outcome);
                    }

                    tracing::warn!(agent = unit.name, attempt, "{}", VALIDATION_FAILED);
                    (ErrorKind::Validation, None)
                }
                Err(err) => {
                    let kind = classify(&err.to_string());
                    tracing::warn!(agent = unit.name, attempt, %kind, error = %err, "attempt failed");

                    self.observer
                        .attempt_finished(&AttemptReport {
                            agent: unit.name.to_string(),
                            attempt,
                            duration_ms: elapsed_ms,
                            cost_usd: None,
                            success: false,
                            error: Some(err.to_string()),
                        })
                        .await;
                    (kind, Some(err))
                }
            };

            self.rollback(&checkpoint, unit).await;

            if !kind.is_retryable() {
                return Err(ExecutorError::NonRetryable {
                    agent: unit.name.to_string(),
                    attempt,
                    kind,
                    source: source.unwrap_or_else(|| AgentError::Execution(VALIDATION_FAILED.into())),
                });
            }

            if attempt >= max_attempts {
                return Err(match source {
                    Some(source) => ExecutorError::RetriesExhausted {
                        agent: unit.name.to_string(),
                        attempts: attempt,
                        source,
                    },
                    None => ExecutorError::ValidationExhausted {
                        agent: unit.name.to_string(),
                        attempts: attempt,
                    },
                });
            }

            let delay = backoff_delay(&self.settings, kind, attempt);
            self.observer
                .retry_scheduled(unit.name, attempt, kind, delay)
                .await;
            tracing::info!(
                agent = unit.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// A failed rollback must not mask the attempt's own error; the next
    /// checkpoint still snapshots whatever is on disk.
    async fn rollback(&self, checkpoint: &Checkpoint, unit: &WorkUnit<'_>) {
        if let Err(e) = unit.checkpoints.rollback(checkpoint).await {
            tracing::error!(
                agent = unit.name,
                attempt = checkpoint.attempt,
                error = %e,
                "rollback failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn settings(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            validation_delay: Duration::from_millis(2),
        }
    }

    fn outcome(output: &str) -> AgentOutcome {
        AgentOutcome {
            output: output.to_string(),
            duration_ms: 5,
            cost_usd: Some(0.5),
            num_turns: Some(2),
            model: None,
        }
    }

    /// Replays a fixed list of attempt results.
    struct ScriptedRunner {
        steps: Mutex<VecDeque<Result<AgentOutcome, String>>>,
        calls: Mutex<Vec<u32>>,
    }

    impl ScriptedRunner {
        fn new(steps: Vec<Result<AgentOutcome, String>>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UnitRunner for ScriptedRunner {
        async fn run(&self, attempt: u32) -> Result<AgentOutcome, AgentError> {
            self.calls.lock().unwrap().push(attempt);
            match self.steps.lock().unwrap().pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(msg)) => Err(AgentError::Execution(msg)),
                None => panic!("runner called more often than scripted"),
            }
        }
    }

    struct ScriptedValidator {
        verdicts: Mutex<VecDeque<bool>>,
    }

    impl ScriptedValidator {
        fn always_pass() -> Self {
            Self::new(Vec::new())
        }

        fn new(verdicts: Vec<bool>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts.into()),
            }
        }
    }

    #[async_trait]
    impl Validator for ScriptedValidator {
        async fn validate(&self, _outcome: &AgentOutcome) -> anyhow::Result<bool> {
            Ok(self.verdicts.lock().unwrap().pop_front().unwrap_or(true))
        }
    }

    #[derive(Default)]
    struct RecordingCheckpoints {
        created: Mutex<Vec<u32>>,
        rolled_back: Mutex<Vec<u32>>,
        committed: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl CheckpointStore for RecordingCheckpoints {
        async fn create(&self, label: &str, attempt: u32) -> anyhow::Result<Checkpoint> {
            self.created.lock().unwrap().push(attempt);
            Ok(Checkpoint {
                id: format!("cp-{}", attempt),
                label: label.to_string(),
                attempt,
            })
        }

        async fn rollback(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
            self.rolled_back.lock().unwrap().push(checkpoint.attempt);
            Ok(())
        }

        async fn commit(&self, checkpoint: &Checkpoint) -> anyhow::Result<String> {
            self.committed.lock().unwrap().push(checkpoint.attempt);
            Ok(format!("commit-{}", checkpoint.attempt))
        }
    }

    impl RecordingCheckpoints {
        fn counts(&self) -> (usize, usize, usize) {
            (
                self.created.lock().unwrap().len(),
                self.rolled_back.lock().unwrap().len(),
                self.committed.lock().unwrap().len(),
            )
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        started: Mutex<Vec<u32>>,
        reports: Mutex<Vec<AttemptReport>>,
        delays: Mutex<Vec<(ErrorKind, Duration)>>,
    }

    #[async_trait]
    impl AttemptObserver for RecordingObserver {
        async fn attempt_started(&self, _agent: &str, attempt: u32) {
            self.started.lock().unwrap().push(attempt);
        }

        async fn attempt_finished(&self, report: &AttemptReport) {
            self.reports.lock().unwrap().push(report.clone());
        }

        async fn retry_scheduled(&self, _agent: &str, _attempt: u32, kind: ErrorKind, delay: Duration) {
            self.delays.lock().unwrap().push((kind, delay));
        }
    }

    async fn execute(
        max_attempts: u32,
        runner: &ScriptedRunner,
        validator: &ScriptedValidator,
        checkpoints: &RecordingCheckpoints,
        observer: Arc<RecordingObserver>,
    ) -> Result<AgentOutcome, ExecutorError> {
        let executor = RetryExecutor::new(settings(max_attempts), observer);
        executor
            .execute(&WorkUnit {
                name: "recon",
                runner,
                validator,
                checkpoints,
            })
            .await
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let runner = ScriptedRunner::new(vec![Ok(outcome("done"))]);
        let checkpoints = RecordingCheckpoints::default();
        let observer = Arc::new(RecordingObserver::default());

        let result = execute(
            3,
            &runner,
            &ScriptedValidator::always_pass(),
            &checkpoints,
            observer.clone(),
        )
        .await
        .unwrap();

        assert_eq!(result.output, "done");
        assert_eq!(checkpoints.counts(), (1, 0, 1));
        assert_eq!(runner.calls(), vec![1]);
        let reports = observer.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].success);
        assert_eq!(reports[0].cost_usd, Some(0.5));
    }

    #[tokio::test]
    async fn test_rate_limit_twice_then_success() {
        let runner = ScriptedRunner::new(vec![
            Err("Rate limit exceeded".into()),
            Err("Rate limit exceeded".into()),
            Ok(outcome("third time lucky")),
        ]);
        let checkpoints = RecordingCheckpoints::default();
        let observer = Arc::new(RecordingObserver::default());

        let result = execute(
            3,
            &runner,
            &ScriptedValidator::always_pass(),
            &checkpoints,
            observer.clone(),
        )
        .await
        .unwrap();

        assert_eq!(result.output, "third time lucky");
        assert_eq!(checkpoints.counts(), (3, 2, 1));
        assert_eq!(*checkpoints.rolled_back.lock().unwrap(), vec![1, 2]);
        assert_eq!(*checkpoints.committed.lock().unwrap(), vec![3]);

        let delays = observer.delays.lock().unwrap();
        assert_eq!(delays.len(), 2);
        assert!(delays.iter().all(|(kind, _)| *kind == ErrorKind::RateLimit));
        assert!(delays[1].1 >= delays[0].1);
    }

    #[tokio::test]
    async fn test_invalid_api_key_aborts_immediately() {
        let runner = ScriptedRunner::new(vec![Err("invalid api key".into())]);
        let checkpoints = RecordingCheckpoints::default();
        let observer = Arc::new(RecordingObserver::default());

        let err = execute(
            3,
            &runner,
            &ScriptedValidator::always_pass(),
            &checkpoints,
            observer.clone(),
        )
        .await
        .unwrap_err();

        match err {
            ExecutorError::NonRetryable { attempt, kind, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(kind, ErrorKind::Authentication);
            }
            other => panic!("Expected NonRetryable, got {:?}", other),
        }
        assert_eq!(checkpoints.counts(), (1, 1, 0));
        assert_eq!(runner.calls(), vec![1]);
        assert!(observer.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_rolls_back_every_attempt() {
        let runner = ScriptedRunner::new(vec![
            Err("socket hang up".into()),
            Err("socket hang up".into()),
            Err("socket hang up".into()),
            Err("socket hang up".into()),
        ]);
        let checkpoints = RecordingCheckpoints::default();

        let err = execute(
            4,
            &runner,
            &ScriptedValidator::always_pass(),
            &checkpoints,
            Arc::new(RecordingObserver::default()),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ExecutorError::RetriesExhausted { attempts: 4, .. }
        ));
        assert_eq!(checkpoints.counts(), (4, 4, 0));
        assert_eq!(runner.calls(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_validation_consumes_a_retry() {
        let runner = ScriptedRunner::new(vec![Ok(outcome("empty")), Ok(outcome("good"))]);
        let validator = ScriptedValidator::new(vec![false, true]);
        let checkpoints = RecordingCheckpoints::default();
        let observer = Arc::new(RecordingObserver::default());

        let result = execute(3, &runner, &validator, &checkpoints, observer.clone())
            .await
            .unwrap();

        assert_eq!(result.output, "good");
        assert_eq!(checkpoints.counts(), (2, 1, 1));

        let reports = observer.reports.lock().unwrap();
        assert!(!reports[0].success);
        assert_eq!(reports[0].error.as_deref(), Some(VALIDATION_FAILED));
        let delays = observer.delays.lock().unwrap();
        assert_eq!(*delays, vec![(ErrorKind::Validation, Duration::from_millis(2))]);
    }

    #[tokio::test]
    async fn test_validation_exhausted_is_distinct_error() {
        let runner = ScriptedRunner::new(vec![Ok(outcome("a")), Ok(outcome("b"))]);
        let validator = ScriptedValidator::new(vec![false, false]);
        let checkpoints = RecordingCheckpoints::default();

        let err = execute(
            2,
            &runner,
            &validator,
            &checkpoints,
            Arc::new(RecordingObserver::default()),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ExecutorError::ValidationExhausted { attempts: 2, .. }
        ));
        assert_eq!(checkpoints.counts(), (2, 2, 0));
    }

    #[tokio::test]
    async fn test_zero_budget_still_runs_once() {
        let runner = ScriptedRunner::new(vec![Ok(outcome("once"))]);
        let checkpoints = RecordingCheckpoints::default();
        let result = execute(
            0,
            &runner,
            &ScriptedValidator::always_pass(),
            &checkpoints,
            Arc::new(RecordingObserver::default()),
        )
        .await
        .unwrap();
        assert_eq!(result.output, "once");
    }

    #[tokio::test]
    async fn test_observer_sees_every_attempt_start() {
        let runner = ScriptedRunner::new(vec![Err("503 Service Unavailable".into()), Ok(outcome("ok"))]);
        let observer = Arc::new(RecordingObserver::default());
        execute(
            3,
            &runner,
            &ScriptedValidator::always_pass(),
            &RecordingCheckpoints::default(),
            observer.clone(),
        )
        .await
        .unwrap();

        assert_eq!(*observer.started.lock().unwrap(), vec![1, 2]);
        let delays = observer.delays.lock().unwrap();
        assert_eq!(delays[0].0, ErrorKind::ServerError);
        assert_eq!(delays[0].1, Duration::from_millis(2));
    }

    struct BrokenValidator;

    #[async_trait]
    impl Validator for BrokenValidator {
        async fn validate(&self, _outcome: &AgentOutcome) -> anyhow::Result<bool> {
            anyhow::bail!("deliverables directory unreadable")
        }
    }

    #[tokio::test]
    async fn test_validator_error_closes_the_attempt() {
        let runner = ScriptedRunner::new(vec![Ok(outcome("done"))]);
        let checkpoints = RecordingCheckpoints::default();
        let observer = Arc::new(RecordingObserver::default());
        let executor = RetryExecutor::new(settings(3), observer.clone());

        let err = executor
            .execute(&WorkUnit {
                name: "recon",
                runner: &runner,
                validator: &BrokenValidator,
                checkpoints: &checkpoints,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Validator { .. }));
        assert_eq!(checkpoints.counts(), (1, 1, 0));
        assert_eq!(*observer.started.lock().unwrap(), vec![1]);
        let reports = observer.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].success);
        assert!(reports[0].error.as_deref().unwrap().contains("deliverables directory unreadable"));
    }
}
