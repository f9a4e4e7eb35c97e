//! Deliverable files each agent is expected to leave in the target repository,
//! plus the activities that read them: output validation, the exploitation
//! gate, and report assembly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{AgentName, AgentOutcome, VulnClass};
use crate::retry::Validator;

pub const DELIVERABLES_DIR: &str = "deliverables";
pub const REPORT_FILE: &str = "comprehensive_security_assessment_report.md";

pub fn queue_file(class: VulnClass) -> String {
    format!("{}/{}_exploitation_queue.json", DELIVERABLES_DIR, class)
}

pub fn evidence_file(class: VulnClass) -> String {
    format!("{}/{}_exploitation_evidence.md", DELIVERABLES_DIR, class)
}

impl AgentName {
    /// Files (relative to the repository root) the agent must produce.
    pub fn deliverables(&self) -> Vec<String> {
        match self {
            Self::PreRecon => vec![format!("{}/pre_recon_deliverable.md", DELIVERABLES_DIR)],
            Self::Recon => vec![format!("{}/recon_deliverable.md", DELIVERABLES_DIR)],
            Self::Vuln(class) => vec![
                format!("{}/{}_analysis_deliverable.md", DELIVERABLES_DIR, class),
                queue_file(*class),
            ],
            Self::Exploit(class) => vec![evidence_file(*class)],
            Self::Report => vec![format!("{}/{}", DELIVERABLES_DIR, REPORT_FILE)],
        }
    }

    /// Pathspecs the agent's checkpoints cover: its deliverables plus its own
    /// scratch directory.
    pub fn checkpoint_scope(&self) -> Vec<String> {
        let mut scope = self.deliverables();
        scope.push(format!("{}/{}", DELIVERABLES_DIR, self));
        scope
    }
}

#[derive(Debug, Deserialize)]
struct ExploitationQueue {
    vulnerabilities: Vec<serde_json::Value>,
}

fn read_queue(repo: &Path, class: VulnClass) -> Result<ExploitationQueue> {
    let path = repo.join(queue_file(class));
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read exploitation queue {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Malformed exploitation queue {}", path.display()))
}

/// Outcome of the exploitation gate for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDecision {
    pub should_exploit: bool,
    pub vulnerability_count: usize,
    pub class: VulnClass,
}

/// Decide whether the exploit agent for `class` should run.
///
/// A missing or malformed queue is an error rather than a "no": the vuln agent
/// was validated, so the file should be there.
pub fn check_queue(repo: &Path, class: VulnClass) -> Result<QueueDecision> {
    let queue = read_queue(repo, class)?;
    let count = queue.vulnerabilities.len();
    Ok(QueueDecision {
        should_exploit: count > 0,
        vulnerability_count: count,
        class,
    })
}

/// Concatenate the exploitation evidence that exists into the report draft.
///
/// Returns the path of the draft and how many evidence files went into it.
pub fn assemble_report(repo: &Path, classes: &[VulnClass]) -> Result<(PathBuf, usize)> {
    let dir = repo.join(DELIVERABLES_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut sections = Vec::new();
    for class in classes {
        let path = repo.join(evidence_file(*class));
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => sections.push(content),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        }
    }

    let report_path = dir.join(REPORT_FILE);
    let draft = if sections.is_empty() {
        "# Security Assessment Report\n\nNo exploitation evidence was produced.\n".to_string()
    } else {
        sections.join("\n\n")
    };
    std::fs::write(&report_path, draft)
        .with_context(|| format!("Failed to write {}", report_path.display()))?;

    Ok((report_path, sections.len()))
}

/// Checks that an agent left non-empty deliverables behind.
pub struct DeliverableValidator {
    repo: PathBuf,
    agent: AgentName,
}

impl DeliverableValidator {
    pub fn new(repo: &Path, agent: AgentName) -> Self {
        Self {
            repo: repo.to_path_buf(),
            agent,
        }
    }

    /// Names of missing or empty deliverables; empty when everything is in place.
    pub fn missing(&self) -> Vec<String> {
        self.agent
            .deliverables()
            .into_iter()
            .filter(|rel| {
                std::fs::metadata(self.repo.join(rel))
                    .map(|m| !m.is_file() || m.len() == 0)
                    .unwrap_or(true)
            })
            .collect()
    }
}

#[async_trait]
impl Validator for DeliverableValidator {
    async fn validate(&self, _outcome: &AgentOutcome) -> Result<bool> {
        let missing = self.missing();
        if !missing.is_empty() {
            tracing::warn!(agent = %self.agent, ?missing, "deliverables missing");
            return Ok(false);
        }

        if let AgentName::Vuln(class) = self.agent
            && let Err(e) = read_queue(&self.repo, class)
        {
            tracing::warn!(agent = %self.agent, error = %e, "exploitation queue invalid");
            return Ok(false);
        }

        Ok(true)
    }
}
