use crate::agents::{AgentName, VulnClass};

pub const PRE_RECON_PHASE: &str = "pre-reconnaissance";
pub const RECON_PHASE: &str = "reconnaissance";
pub const EXPLOITATION_PHASE: &str = "vulnerability-exploitation";
pub const REPORTING_PHASE: &str = "reporting";

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// A single agent, run to completion before the next phase starts.
    Ordered { name: String, agent: AgentName },
    /// One independent `vuln -> gate -> exploit` sub-pipeline per class.
    Parallel { name: String, classes: Vec<VulnClass> },
}

impl Phase {
    pub fn ordered(name: &str, agent: AgentName) -> Self {
        Self::Ordered {
            name: name.to_string(),
            agent,
        }
    }

    pub fn parallel(name: &str, classes: &[VulnClass]) -> Self {
        Self::Parallel {
            name: name.to_string(),
            classes: classes.to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ordered { name, .. } | Self::Parallel { name, .. } => name,
        }
    }
}

/// The fixed phase sequence a run walks through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    phases: Vec<Phase>,
}

impl PipelinePlan {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// pre-recon, recon, the per-class exploitation fan-out, then the report.
    pub fn standard(classes: &[VulnClass]) -> Self {
        Self::new(vec![
            Phase::ordered(PRE_RECON_PHASE, AgentName::PreRecon),
            Phase::ordered(RECON_PHASE, AgentName::Recon),
            Phase::parallel(EXPLOITATION_PHASE, classes),
            Phase::ordered(REPORTING_PHASE, AgentName::Report),
        ])
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Every class fanned out by a parallel phase, in plan order.
    pub fn classes(&self) -> Vec<VulnClass> {
        self.phases
            .iter()
            .filter_map(|p| match p {
                Phase::Parallel { classes, .. } => Some(classes.iter().copied()),
                Phase::Ordered { .. } => None,
            })
            .flatten()
            .collect()
    }

    /// Total number of agents a fully exploiting run would execute.
    pub fn max_agents(&self) -> usize {
        self.phases
            .iter()
            .map(|p| match p {
                Phase::Ordered { .. } => 1,
                Phase::Parallel { classes, .. } => classes.len() * 2,
            })
            .sum()
    }
}
