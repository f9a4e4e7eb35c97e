//! Pipeline orchestration: the run record, the phase plan, the orchestrator
//! that walks it, and the registry that supervises runs.

pub mod dispatch;
pub mod launch;
pub mod orchestrator;
pub mod phase;
pub mod registry;
pub mod state;

pub use dispatch::{ActivityDispatcher, LocalDispatcher};
pub use launch::{RunRequest, launch};
pub use orchestrator::{Orchestrator, RunOutcome, SubPipelineOutcome};
pub use phase::{Phase, PipelinePlan};
pub use registry::{FinishedRun, RunHandle, RunRegistry};
pub use state::RunState;
