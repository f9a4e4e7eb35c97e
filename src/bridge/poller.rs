//! One poll step for one run.
//!
//! [`RunPoller`] holds the per-run error-dedup state and turns a progress
//! query, plus the authoritative status when the two might disagree, into
//! progress, terminal and error messages. Phase changes are diffed per
//! subscription by the bridge. Scheduling lives in the caller; `poll_once`
//! only says how long to wait next.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use warden_common::{
    ProgressSource, QueryError, RunDescription, RunSnapshot, RunStatus, RunSummary, StatusSource,
};

use super::messages::BridgeMessage;
use crate::config::BridgeSettings;

/// What the poll loop should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Continue(Duration),
    Stop,
}

pub struct RunPoller {
    run_id: String,
    progress: Arc<dyn ProgressSource>,
    status: Arc<dyn StatusSource>,
    settings: BridgeSettings,
    last_error: Option<(String, Instant)>,
}

impl RunPoller {
    pub fn new(
        run_id: &str,
        progress: Arc<dyn ProgressSource>,
        status: Arc<dyn StatusSource>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            progress,
            status,
            settings,
            last_error: None,
        }
    }

    pub async fn poll_once(&mut self, now: Instant) -> (Vec<BridgeMessage>, PollStep) {
        match self.progress.get_progress(&self.run_id).await {
            Ok(snapshot) => {
                let snapshot = if snapshot.status == RunStatus::Running {
                    self.reconcile(snapshot).await
                } else {
                    snapshot
                };
                self.emit(snapshot)
            }
            Err(QueryError::NotReady(_)) => {
                tracing::debug!(run_id = %self.run_id, "progress not initialized yet");
                (Vec::new(), PollStep::Continue(self.settings.error_poll_interval))
            }
            Err(e) if e.needs_status_fallback() => self.fall_back(e, now).await,
            Err(e) => self.query_failed(e.to_string(), now),
        }
    }

    /// A `running` record may be stale; the authoritative status wins.
    async fn reconcile(&self, snapshot: RunSnapshot) -> RunSnapshot {
        match self.status.describe(&self.run_id).await {
            Ok(description) if description.status.is_terminal() => {
                tracing::info!(
                    run_id = %self.run_id,
                    status = %description.status,
                    "progress record is stale; using authoritative status"
                );
                synthesize_terminal(snapshot, &description)
            }
            Ok(_) => snapshot,
            Err(e) => {
                tracing::debug!(run_id = %self.run_id, error = %e, "status check failed");
                snapshot
            }
        }
    }

    /// The progress query cannot answer; ask the status source directly.
    async fn fall_back(&mut self, query_error: QueryError, now: Instant) -> (Vec<BridgeMessage>, PollStep) {
        match self.status.describe(&self.run_id).await {
            Ok(description) if description.status.is_terminal() => {
                let base = RunSnapshot::new(&self.run_id, description.start_time);
                self.emit(synthesize_terminal(base, &description))
            }
            Ok(_) => {
                tracing::debug!(run_id = %self.run_id, error = %query_error, "progress unavailable, run still active");
                (Vec::new(), PollStep::Continue(self.settings.error_poll_interval))
            }
            Err(status_error) => {
                tracing::debug!(run_id = %self.run_id, error = %status_error, "status fallback failed");
                self.query_failed(query_error.to_string(), now)
            }
        }
    }

    fn emit(&self, snapshot: RunSnapshot) -> (Vec<BridgeMessage>, PollStep) {
        let mut messages = vec![BridgeMessage::Progress {
            run_id: self.run_id.clone(),
            data: snapshot.clone(),
        }];

        match snapshot.status {
            RunStatus::Running => (messages, PollStep::Continue(self.settings.poll_interval)),
            RunStatus::Completed => {
                messages.push(BridgeMessage::Complete {
                    run_id: self.run_id.clone(),
                    data: snapshot,
                });
                (messages, PollStep::Stop)
            }
            RunStatus::Failed => {
                messages.push(BridgeMessage::Failed {
                    run_id: self.run_id.clone(),
                    data: snapshot,
                });
                (messages, PollStep::Stop)
            }
        }
    }

    /// Surface an error unless the same text went out within the cooldown.
    fn query_failed(&mut self, message: String, now: Instant) -> (Vec<BridgeMessage>, PollStep) {
        let next = PollStep::Continue(self.settings.error_poll_interval);

        if let Some((last, at)) = &self.last_error {
            if *last == message && now.saturating_duration_since(*at) < self.settings.error_cooldown {
                tracing::debug!(run_id = %self.run_id, error = %message, "suppressing repeated error");
                return (Vec::new(), next);
            }
        }

        tracing::warn!(run_id = %self.run_id, error = %message, "progress query failed");
        self.last_error = Some((message.clone(), now));
        (
            vec![BridgeMessage::Error {
                run_id: Some(self.run_id.clone()),
                message,
            }],
            next,
        )
    }
}

/// Terminal snapshot built from a stale record and the authoritative status.
pub fn synthesize_terminal(mut snapshot: RunSnapshot, description: &RunDescription) -> RunSnapshot {
    snapshot.status = description.status.as_run_status();
    snapshot.current_agent = None;
    if snapshot.status == RunStatus::Failed && snapshot.error.is_none() {
        snapshot.error = Some(format!(
            "Run {} according to its authoritative status; progress record was stale",
            description.status
        ));
    }
    if snapshot.summary.is_none() {
        let closed = description.close_time.unwrap_or_else(Utc::now);
        snapshot.summary = Some(RunSummary::compute(&snapshot, closed));
    }
    snapshot
}
