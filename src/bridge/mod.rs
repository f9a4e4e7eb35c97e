//! Progress bridge: pushes run progress and workflow-log lines to observers.
//!
//! ```text
//!  observer ──ws──> ws.rs ──subscribe──> ProgressBridge
//!                                          │  one poll task per run
//!                                          │  one log tail per subscription
//!                                          ▼
//!                        ProgressSource / StatusSource (local registry or HTTP)
//! ```
//!
//! Polls for one run never overlap: each loop iteration waits for the previous
//! query to finish before sleeping. Log tailing runs on its own task so slow
//! file IO never delays a poll.

pub mod messages;
pub mod poller;
pub mod remote;
pub mod server;
pub mod tail;
pub mod ws;

pub use messages::{BridgeMessage, ClientMessage};
pub use poller::{PollStep, RunPoller};
pub use remote::RemoteRunSource;
pub use tail::LogTail;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warden_common::{ProgressSource, StatusSource};

use crate::audit::AuditSession;
use crate::config::BridgeSettings;

pub type ObserverId = u64;

/// One observer's view of one run: its log tail and its delivery cursor.
struct Subscription {
    tail: CancellationToken,
    last_phase: Option<String>,
    finished: bool,
}

impl Subscription {
    fn new(tail: CancellationToken) -> Self {
        Self {
            tail,
            last_phase: None,
            finished: false,
        }
    }

    /// Messages this observer should see for `message`. Phase changes are
    /// diffed against what this observer last saw, and nothing about the
    /// run's state follows its terminal event.
    fn deliver(&mut self, message: &BridgeMessage) -> Vec<BridgeMessage> {
        match message {
            BridgeMessage::Progress { .. }
            | BridgeMessage::PhaseChange { .. }
            | BridgeMessage::Complete { .. }
            | BridgeMessage::Failed { .. }
                if self.finished =>
            {
                Vec::new()
            }
            BridgeMessage::Progress { run_id, data } => {
                let mut out = Vec::with_capacity(2);
                if data.current_phase != self.last_phase {
                    out.push(BridgeMessage::PhaseChange {
                        run_id: run_id.clone(),
                        previous: self.last_phase.take(),
                        current: data.current_phase.clone(),
                    });
                    self.last_phase = data.current_phase.clone();
                }
                out.push(message.clone());
                out
            }
            BridgeMessage::Complete { .. } | BridgeMessage::Failed { .. } => {
                self.finished = true;
                vec![message.clone()]
            }
            _ => vec![message.clone()],
        }
    }
}

/// A running poll loop, tagged so a finished loop only clears its own slot.
struct PollLoop {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunWatch {
    subscriptions: HashMap<ObserverId, Subscription>,
    poll: Option<PollLoop>,
    /// Last progress and terminal event, kept once the run has ended.
    finished: Option<[BridgeMessage; 2]>,
}

#[derive(Default)]
struct Table {
    observers: HashMap<ObserverId, mpsc::UnboundedSender<BridgeMessage>>,
    runs: HashMap<String, RunWatch>,
}

impl Table {
    fn send_to_run(&mut self, run_id: &str, messages: &[BridgeMessage]) {
        let Table { observers, runs } = self;
        let Some(watch) = runs.get_mut(run_id) else {
            return;
        };
        for (observer, sub) in watch.subscriptions.iter_mut() {
            let Some(tx) = observers.get(observer) else {
                continue;
            };
            for message in messages {
                for out in sub.deliver(message) {
                    tx.send(out).ok();
                }
            }
        }

        let terminal = messages
            .iter()
            .position(|m| matches!(m, BridgeMessage::Complete { .. } | BridgeMessage::Failed { .. }));
        if let Some(i) = terminal {
            let progress = messages[..i]
                .iter()
                .rev()
                .find(|m| matches!(m, BridgeMessage::Progress { .. }));
            if let Some(progress) = progress {
                watch.finished = Some([progress.clone(), messages[i].clone()]);
            }
        }
    }
}

struct Inner {
    progress: Arc<dyn ProgressSource>,
    status: Arc<dyn StatusSource>,
    settings: BridgeSettings,
    audit_dir: Option<PathBuf>,
    next_observer: AtomicU64,
    next_poll: AtomicU64,
    table: Mutex<Table>,
}

/// Subscription table plus the per-run poll loops it drives.
#[derive(Clone)]
pub struct ProgressBridge {
    inner: Arc<Inner>,
}

impl ProgressBridge {
    pub fn new(
        progress: Arc<dyn ProgressSource>,
        status: Arc<dyn StatusSource>,
        settings: BridgeSettings,
        audit_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                progress,
                status,
                settings,
                audit_dir,
                next_observer: AtomicU64::new(1),
                next_poll: AtomicU64::new(1),
                table: Mutex::new(Table::default()),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // Nothing panics while holding the table lock; recover the data if it ever did.
        self.inner
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an observer. Messages for all its subscriptions arrive on the receiver.
    pub fn connect(&self) -> (ObserverId, mpsc::UnboundedReceiver<BridgeMessage>) {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.table().observers.insert(id, tx);
        tracing::debug!(observer = id, "observer connected");
        (id, rx)
    }

    /// Drop every subscription the observer holds.
    pub fn disconnect(&self, observer: ObserverId) {
        let run_ids: Vec<String> = {
            let mut table = self.table();
            table.observers.remove(&observer);
            table
                .runs
                .iter()
                .filter(|(_, w)| w.subscriptions.contains_key(&observer))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for run_id in run_ids {
            self.unsubscribe(observer, &run_id);
        }
        tracing::debug!(observer, "observer disconnected");
    }

    pub fn subscribe(&self, observer: ObserverId, run_id: &str) {
        let mut table = self.table();
        let Some(tx) = table.observers.get(&observer).cloned() else {
            return;
        };

        let watch = table.runs.entry(run_id.to_string()).or_default();
        if !watch.subscriptions.contains_key(&observer) {
            let tail = CancellationToken::new();
            if let Some(audit_dir) = &self.inner.audit_dir {
                let path = AuditSession::workflow_log_path(audit_dir, run_id);
                tokio::spawn(tail_loop(
                    run_id.to_string(),
                    LogTail::new(&path),
                    tx.clone(),
                    self.inner.settings.log_tail_interval,
                    tail.clone(),
                ));
            }
            watch.subscriptions.insert(observer, Subscription::new(tail));
        }

        tx.send(BridgeMessage::Subscribed {
            run_id: run_id.to_string(),
        })
        .ok();
        tracing::info!(observer, run_id, "subscribed");

        // An ended run never changes again: replay its last state to this
        // observer alone instead of polling it again.
        if let Some(finished) = &watch.finished {
            if let Some(sub) = watch.subscriptions.get_mut(&observer) {
                for message in finished {
                    for out in sub.deliver(message) {
                        tx.send(out).ok();
                    }
                }
            }
            return;
        }

        if watch.poll.is_none() {
            let generation = self.inner.next_poll.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            watch.poll = Some(PollLoop {
                generation,
                cancel: cancel.clone(),
            });
            tokio::spawn(poll_loop(self.clone(), run_id.to_string(), generation, cancel));
        }
    }

    /// Remove one subscription. The last one out stops the run's poll loop,
    /// which drops its error-dedup state with it.
    pub fn unsubscribe(&self, observer: ObserverId, run_id: &str) {
        let mut table = self.table();
        let Some(watch) = table.runs.get_mut(run_id) else {
            return;
        };
        if let Some(sub) = watch.subscriptions.remove(&observer) {
            sub.tail.cancel();
        }
        if watch.subscriptions.is_empty() {
            if let Some(poll) = watch.poll.take() {
                poll.cancel.cancel();
            }
            table.runs.remove(run_id);
            tracing::info!(run_id, "last subscriber left; polling stopped");
        }
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.table()
            .runs
            .get(run_id)
            .map(|w| w.subscriptions.len())
            .unwrap_or(0)
    }

    pub fn is_polling(&self, run_id: &str) -> bool {
        self.table()
            .runs
            .get(run_id)
            .map(|w| w.poll.is_some())
            .unwrap_or(false)
    }

    fn broadcast(&self, run_id: &str, messages: &[BridgeMessage]) {
        self.table().send_to_run(run_id, messages);
    }

    /// Clear the poll slot once a loop ends on its own, unless a newer loop took it.
    fn poll_finished(&self, run_id: &str, generation: u64) {
        let mut table = self.table();
        if let Some(watch) = table.runs.get_mut(run_id) {
            if watch.poll.as_ref().is_some_and(|p| p.generation == generation) {
                watch.poll = None;
            }
        }
    }
}

async fn poll_loop(
    bridge: ProgressBridge,
    run_id: String,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut poller = RunPoller::new(
        &run_id,
        bridge.inner.progress.clone(),
        bridge.inner.status.clone(),
        bridge.inner.settings,
    );

    loop {
        let (messages, step) = tokio::select! {
            _ = cancel.cancelled() => return,
            result = poller.poll_once(Instant::now()) => result,
        };
        if cancel.is_cancelled() {
            return;
        }
        bridge.broadcast(&run_id, &messages);

        let delay = match step {
            PollStep::Continue(delay) => delay,
            PollStep::Stop => {
                tracing::info!(run_id = %run_id, "run reached a terminal state; polling stopped");
                bridge.poll_finished(&run_id, generation);
                return;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn tail_loop(
    run_id: String,
    mut tail: LogTail,
    tx: mpsc::UnboundedSender<BridgeMessage>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        match tail.read_new_lines().await {
            Ok(lines) => {
                for line in lines {
                    if tx
                        .send(BridgeMessage::Log {
                            run_id: run_id.clone(),
                            line,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => tracing::debug!(run_id = %run_id, error = %e, "log tail read failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
