//! Agent catalogue and the adapter that runs agents through the Claude CLI.

pub mod deliverables;
pub mod prompts;
pub mod runner;
pub mod stream;

pub use deliverables::{DeliverableValidator, QueueDecision, assemble_report, check_queue};
pub use runner::{AgentAttempt, ClaudeRunner, RunContext};

use serde::{Deserialize, Serialize};
use warden_common::AgentMetrics;

/// Vulnerability classes, one parallel sub-pipeline each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VulnClass {
    Injection,
    Xss,
    Auth,
    Ssrf,
    Authz,
}

impl VulnClass {
    pub const ALL: [VulnClass; 5] = [
        VulnClass::Injection,
        VulnClass::Xss,
        VulnClass::Auth,
        VulnClass::Ssrf,
        VulnClass::Authz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Injection => "injection",
            Self::Xss => "xss",
            Self::Auth => "auth",
            Self::Ssrf => "ssrf",
            Self::Authz => "authz",
        }
    }
}

impl std::fmt::Display for VulnClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VulnClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VulnClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid vulnerability class '{}'. Valid values: injection, xss, auth, ssrf, authz",
                    s
                )
            })
    }
}

/// Every agent the pipeline can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentName {
    PreRecon,
    Recon,
    Vuln(VulnClass),
    Exploit(VulnClass),
    Report,
}

impl AgentName {
    pub fn class(&self) -> Option<VulnClass> {
        match self {
            Self::Vuln(c) | Self::Exploit(c) => Some(*c),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreRecon => write!(f, "pre-recon"),
            Self::Recon => write!(f, "recon"),
            Self::Vuln(c) => write!(f, "{}-vuln", c),
            Self::Exploit(c) => write!(f, "{}-exploit", c),
            Self::Report => write!(f, "report"),
        }
    }
}

impl std::str::FromStr for AgentName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-recon" => return Ok(Self::PreRecon),
            "recon" => return Ok(Self::Recon),
            "report" => return Ok(Self::Report),
            _ => {}
        }
        if let Some(class) = s.strip_suffix("-vuln") {
            return Ok(Self::Vuln(class.parse()?));
        }
        if let Some(class) = s.strip_suffix("-exploit") {
            return Ok(Self::Exploit(class.parse()?));
        }
        anyhow::bail!("Unknown agent '{}'", s)
    }
}

/// What a successful attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub output: String,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub model: Option<String>,
}

impl AgentOutcome {
    pub fn metrics(&self) -> AgentMetrics {
        AgentMetrics {
            duration_ms: self.duration_ms,
            cost_usd: self.cost_usd,
            num_turns: self.num_turns,
            model: self.model.clone(),
        }
    }
}
