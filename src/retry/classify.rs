//! Error signature table and backoff policy.
//!
//! Classification is purely textual: the agent CLI reports failures as free text,
//! so the table matches known signatures case-insensitively. The first matching
//! row wins, which is why the non-retryable rows come before the transport rows.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

use crate::config::RetrySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    ServerError,
    Network,
    Timeout,
    /// The runner succeeded but its output did not pass validation.
    Validation,
    Authentication,
    Permission,
    InvalidRequest,
    Configuration,
    LimitExceeded,
    Unknown,
}

impl ErrorKind {
    /// Unknown signatures are retried: they burn budget instead of failing a run
    /// on a message nobody has catalogued yet.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::ServerError
                | Self::Network
                | Self::Timeout
                | Self::Validation
                | Self::Unknown
        )
    }

    fn backoff_multiplier(&self) -> u32 {
        match self {
            Self::RateLimit => 6,
            Self::ServerError => 2,
            _ => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::InvalidRequest => "invalid_request",
            Self::Configuration => "configuration",
            Self::LimitExceeded => "limit_exceeded",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message used for failed output validation. Kept stable so it stays
/// distinguishable from runner errors in logs.
pub const VALIDATION_FAILED: &str = "output validation failed";

const SIGNATURES: &[(ErrorKind, &str)] = &[
    (ErrorKind::Validation, r"(?i)output validation failed"),
    (
        ErrorKind::Authentication,
        r"(?i)invalid[ _-]?(x-)?api[ _-]?key|authentication|unauthori[sz]ed|\b401\b|invalid credentials",
    ),
    (
        ErrorKind::Permission,
        r"(?i)permission denied|forbidden|\b403\b|access denied|not permitted",
    ),
    (
        ErrorKind::Configuration,
        r"(?i)configuration error|invalid config|not configured|missing (env|environment)|command not found|no such file or directory",
    ),
    (
        ErrorKind::InvalidRequest,
        r"(?i)invalid[ _]request|malformed|bad request|\b400\b|invalid (parameter|argument)",
    ),
    (
        ErrorKind::LimitExceeded,
        r"(?i)spending (cap|limit)|budget exceeded|usage limit|credit balance|max(imum)? turns",
    ),
    (
        ErrorKind::RateLimit,
        r"(?i)rate[ _-]?limit|too many requests|\b429\b|overloaded|throttl",
    ),
    (
        ErrorKind::ServerError,
        r"(?i)internal server error|server error|service unavailable|bad gateway|\b50[0234]\b|\b529\b",
    ),
    (
        ErrorKind::Timeout,
        r"(?i)\btimed? ?out\b|\btimeout\b|\betimedout\b|deadline exceeded",
    ),
    (
        ErrorKind::Network,
        r"(?i)econn(reset|refused)|connection (reset|refused|closed|aborted)|network|socket hang up|broken pipe|enotfound|dns",
    ),
];

static SIGNATURE_SET: LazyLock<RegexSet> =
    LazyLock::new(|| RegexSet::new(SIGNATURES.iter().map(|(_, p)| *p)).unwrap());

/// Map an error message onto an [`ErrorKind`].
pub fn classify(message: &str) -> ErrorKind {
    SIGNATURE_SET
        .matches(message)
        .iter()
        .next()
        .map(|idx| SIGNATURES[idx].0)
        .unwrap_or(ErrorKind::Unknown)
}

/// Delay before the attempt after `attempt` (1-based) failed with `kind`.
///
/// Validation failures wait a fixed short delay; everything else backs off
/// exponentially from `base_delay`, scaled per kind and capped at `max_delay`.
pub fn backoff_delay(settings: &RetrySettings, kind: ErrorKind, attempt: u32) -> Duration {
    if kind == ErrorKind::Validation {
        return settings.validation_delay;
    }

    let exponent = attempt.saturating_sub(1).min(20);
    let millis = settings
        .base_delay
        .as_millis()
        .saturating_mul(kind.backoff_multiplier() as u128)
        .saturating_mul(1u128 << exponent);
    let capped = millis.min(settings.max_delay.as_millis());

    Duration::from_millis(capped as u64)
}
