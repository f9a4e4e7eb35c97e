use serde::{Deserialize, Serialize};
use warden_common::RunSnapshot;

/// Server-pushed messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Subscribed {
        run_id: String,
    },
    Progress {
        run_id: String,
        data: RunSnapshot,
    },
    PhaseChange {
        run_id: String,
        previous: Option<String>,
        current: Option<String>,
    },
    Log {
        run_id: String,
        line: String,
    },
    Complete {
        run_id: String,
        data: RunSnapshot,
    },
    Failed {
        run_id: String,
        data: RunSnapshot,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        message: String,
    },
}

impl BridgeMessage {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::Subscribed { run_id }
            | Self::Progress { run_id, .. }
            | Self::PhaseChange { run_id, .. }
            | Self::Log { run_id, .. }
            | Self::Complete { run_id, .. }
            | Self::Failed { run_id, .. } => Some(run_id),
            Self::Error { run_id, .. } => run_id.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribed { .. } => "subscribed",
            Self::Progress { .. } => "progress",
            Self::PhaseChange { .. } => "phase_change",
            Self::Log { .. } => "log",
            Self::Complete { .. } => "complete",
            Self::Failed { .. } => "failed",
            Self::Error { .. } => "error",
        }
    }
}

/// Observer-to-bridge requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { run_id: String },
    Unsubscribe { run_id: String },
}
