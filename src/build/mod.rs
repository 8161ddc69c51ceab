//! Per-extension build orchestration: the backend seam and the incremental
//! context lifecycle.

mod backend;
mod orchestrator;

pub use backend::{
    BuildArtifactRef, BuildBackend, BuildError, BuildOutcome, CommandBackend, ContextHandle,
    artifact_dir,
};
pub use orchestrator::BuildOrchestrator;
