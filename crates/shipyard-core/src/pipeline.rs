//! Pipeline and stage definitions.
//!
//! A pipeline is a strictly linear sequence of stages: one Source stage,
//! then Build, then optionally Deploy. Each stage declares the artifact it
//! consumes and the artifact it produces; [`PipelineSpec::validate`] checks
//! that the declarations chain before anything runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::artifact::{ArtifactDecl, ArtifactKind};
use crate::deployer::DeployTarget;
use crate::source::SourceLocator;
use crate::{Error, Result};

/// Default time a Deploy stage waits for its input artifact.
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(600);

/// A CI/CD pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Pipeline name (e.g., "CodePipelineFlaskApp").
    pub name: String,
    /// Application the pipeline builds.
    pub application: String,
    /// Where the source comes from.
    pub source: SourceLocator,
    /// Name of the target registry resource.
    pub registry: String,
    /// Parameter store key the latest image tag is written to.
    pub parameter_key: String,
    /// Ordered stages.
    pub stages: Vec<StageSpec>,
    /// Stage-level retry policy.
    pub retry: RetryPolicy,
    /// Stacks that must be provisioned before the pipeline may start.
    pub requires: Vec<String>,
}

/// Kind of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    Source,
    Build,
    Deploy,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Source => write!(f, "source"),
            StageKind::Build => write!(f, "build"),
            StageKind::Deploy => write!(f, "deploy"),
        }
    }
}

/// An environment variable made available to a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvBinding {
    /// Literal value.
    Plaintext(String),
    /// Name of a parameter store key, resolved at build time.
    Parameter(String),
}

/// Compute size for a build host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl std::str::FromStr for ComputeSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "small" => Ok(ComputeSize::Small),
            "medium" => Ok(ComputeSize::Medium),
            "large" => Ok(ComputeSize::Large),
            other => Err(Error::InvalidInput(format!("unknown compute size: {}", other))),
        }
    }
}

/// How a Build stage builds its image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Build project name (e.g., "BuildFlaskAppEcrImage").
    pub project: String,
    /// Build context directory.
    pub context: String,
    /// Dockerfile path.
    pub dockerfile: String,
    /// Build procedure reference (buildspec file), if any.
    pub buildspec: Option<String>,
    pub privileged: bool,
    pub compute: ComputeSize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            project: String::new(),
            context: ".".to_string(),
            dockerfile: "Dockerfile".to_string(),
            buildspec: None,
            privileged: true,
            compute: ComputeSize::Medium,
        }
    }
}

/// How a Deploy stage rolls the image out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySettings {
    pub target: DeployTarget,
    /// How long to wait for the image artifact.
    pub timeout: Duration,
}

/// What a stage does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageAction {
    /// Resolve the pipeline's source locator to a revision.
    Source,
    /// Build, push and publish an image.
    Build(BuildSettings),
    /// Roll out the image produced by the Build stage.
    Deploy(DeploySettings),
}

/// A stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name.
    pub name: String,
    pub action: StageAction,
    /// Artifact consumed. None only for Source.
    pub input: Option<ArtifactDecl>,
    /// Artifact produced. None only for a terminal Deploy.
    pub output: Option<ArtifactDecl>,
    /// Stage-specific environment bindings.
    pub env: BTreeMap<String, EnvBinding>,
}

impl StageSpec {
    pub fn kind(&self) -> StageKind {
        match self.action {
            StageAction::Source => StageKind::Source,
            StageAction::Build(_) => StageKind::Build,
            StageAction::Deploy(_) => StageKind::Deploy,
        }
    }

    pub fn source(name: impl Into<String>, output: ArtifactDecl) -> Self {
        Self {
            name: name.into(),
            action: StageAction::Source,
            input: None,
            output: Some(output),
            env: BTreeMap::new(),
        }
    }

    pub fn build(
        name: impl Into<String>,
        settings: BuildSettings,
        input: ArtifactDecl,
        output: ArtifactDecl,
    ) -> Self {
        Self {
            name: name.into(),
            action: StageAction::Build(settings),
            input: Some(input),
            output: Some(output),
            env: BTreeMap::new(),
        }
    }

    pub fn deploy(name: impl Into<String>, settings: DeploySettings, input: ArtifactDecl) -> Self {
        Self {
            name: name.into(),
            action: StageAction::Deploy(settings),
            input: Some(input),
            output: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, binding: EnvBinding) -> Self {
        self.env.insert(key.into(), binding);
        self
    }

    /// Artifact kinds this stage accepts and produces.
    fn expected_kinds(&self) -> (Option<ArtifactKind>, Option<ArtifactKind>) {
        match self.kind() {
            StageKind::Source => (None, Some(ArtifactKind::Source)),
            StageKind::Build => (Some(ArtifactKind::Source), Some(ArtifactKind::Image)),
            StageKind::Deploy => (Some(ArtifactKind::Image), None),
        }
    }
}

/// Retry policy for execution-time stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero surfaces failures immediately.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Overall pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// Waiting to start.
    Pending,
    /// Currently running.
    Running { stage: String },
    /// Completed successfully.
    Succeeded,
    /// Failed at the named stage.
    Failed { stage: String, message: String },
    /// Cancelled between stages.
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Succeeded | PipelineStatus::Failed { .. } | PipelineStatus::Cancelled
        )
    }
}

impl PipelineSpec {
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn has_deploy(&self) -> bool {
        self.stages.iter().any(|s| s.kind() == StageKind::Deploy)
    }

    /// Check the stage sequence before any execution.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .stages
            .first()
            .filter(|s| s.kind() == StageKind::Source)
            .ok_or_else(|| Error::EmptyPipeline(self.name.clone()))?;

        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "pipeline '{}' has duplicate stage '{}'",
                    self.name, stage.name
                )));
            }
            if stage.kind() == StageKind::Source && !std::ptr::eq(stage, first) {
                return Err(Error::InvalidInput(format!(
                    "pipeline '{}' has more than one source stage",
                    self.name
                )));
            }
            if stage.env.keys().any(|k| k.is_empty()) {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' has an empty environment variable name",
                    stage.name
                )));
            }
        }

        let mut previous: Option<&StageSpec> = None;
        for stage in &self.stages {
            let upstream = previous.and_then(|p| p.output.as_ref());
            if stage.input.as_ref() != upstream {
                return Err(mismatch(&stage.name, upstream, stage.input.as_ref()));
            }

            let (want_in, want_out) = stage.expected_kinds();
            if stage.input.as_ref().map(|d| d.kind) != want_in {
                return Err(Error::ArtifactTypeMismatch {
                    stage: stage.name.clone(),
                    expected: kind_label(want_in),
                    found: decl_label(stage.input.as_ref()),
                });
            }
            // A Build stage may omit its output only if it is last.
            let output_ok = match (&stage.output, want_out) {
                (Some(decl), Some(kind)) => decl.kind == kind,
                (None, None) => true,
                (None, Some(_)) => stage.kind() == StageKind::Build,
                (Some(_), None) => false,
            };
            if !output_ok {
                return Err(Error::ArtifactTypeMismatch {
                    stage: stage.name.clone(),
                    expected: kind_label(want_out),
                    found: decl_label(stage.output.as_ref()),
                });
            }
            previous = Some(stage);
        }

        Ok(())
    }
}

fn decl_label(decl: Option<&ArtifactDecl>) -> String {
    decl.map(|d| d.to_string()).unwrap_or_else(|| "none".to_string())
}

fn kind_label(kind: Option<ArtifactKind>) -> String {
    kind.map(|k| format!("{} artifact", k))
        .unwrap_or_else(|| "none".to_string())
}

fn mismatch(stage: &str, expected: Option<&ArtifactDecl>, found: Option<&ArtifactDecl>) -> Error {
    Error::ArtifactTypeMismatch {
        stage: stage.to_string(),
        expected: decl_label(expected),
        found: decl_label(found),
    }
}
