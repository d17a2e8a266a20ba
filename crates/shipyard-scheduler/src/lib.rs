//! Pipeline and stack provisioning runtime for Shipyard.
//!
//! Runs pipelines stage by stage against pluggable collaborators and
//! provisions the stack graph with independent subtrees in parallel.

pub mod build;
pub mod deploy;
pub mod orchestrator;
pub mod provisioner;

pub use build::{BuildFailure, BuildStage};
pub use deploy::DeployStage;
pub use orchestrator::{
    CancelHandle, PipelineBackends, PipelineEvent, PipelineOrchestrator, PipelineResult,
    PipelineRun, SharedResources, StageState,
};
pub use provisioner::{ProvisionReport, StackProvisioning, StackSnapshot};
