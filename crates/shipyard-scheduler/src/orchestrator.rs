//! Pipeline orchestrator - executes pipeline stages strictly in order.

use shipyard_core::artifact::{
    Artifact, ArtifactChannel, ArtifactDecl, ArtifactPayload, ArtifactSubscription,
};
use shipyard_core::build::{BuildExecution, Clock, SystemClock};
use shipyard_core::deployer::{Deployer, DeploymentReceipt};
use shipyard_core::parameter::ParameterStore;
use shipyard_core::pipeline::{PipelineSpec, PipelineStatus, StageAction, StageSpec};
use shipyard_core::registry::{ImageReference, ImageRegistry};
use shipyard_core::resource::ResourceRegistry;
use shipyard_core::source::{SourceProvider, SourceRevision};
use shipyard_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{error, info, warn};

use crate::build::BuildStage;
use crate::deploy::DeployStage;
use crate::provisioner::StackSnapshot;

/// Resource registry shared between the provisioner and running pipelines.
pub type SharedResources = Arc<RwLock<ResourceRegistry>>;

/// How long a run waits for its required stacks by default.
pub const DEFAULT_STACK_GATE_TIMEOUT: Duration = Duration::from_secs(3600);

/// State of a stage during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running { attempt: u32 },
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded | StageState::Failed { .. } | StageState::Skipped { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageState::Succeeded)
    }
}

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted {
        stage: String,
        attempt: u32,
    },
    StageRetrying {
        stage: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    StageCompleted {
        stage: String,
        success: bool,
    },
    ImagePushed {
        stage: String,
        image: String,
        digest: String,
    },
    ParameterWritten {
        key: String,
        value: String,
    },
    PipelineCompleted {
        status: PipelineStatus,
    },
}

/// Result of a pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    pub pipeline: String,
    pub status: PipelineStatus,
    pub stage_states: HashMap<String, StageState>,
    pub source: Option<SourceRevision>,
    /// Every build execution of the run, failed attempts included.
    pub builds: Vec<BuildExecution>,
    pub deployment: Option<DeploymentReceipt>,
    /// Artifacts published during the run, by name.
    pub artifacts: BTreeMap<String, Arc<Artifact>>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    /// Name of the stage the run failed at.
    pub fn failed_stage(&self) -> Option<&str> {
        match &self.status {
            PipelineStatus::Failed { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// The image pushed by the last successful build.
    pub fn image(&self) -> Option<ImageReference> {
        self.builds.iter().rev().find_map(|b| b.image())
    }
}

/// Collaborators a pipeline run talks to.
#[derive(Clone)]
pub struct PipelineBackends {
    pub source: Arc<dyn SourceProvider>,
    pub registry: Arc<dyn ImageRegistry>,
    pub parameters: Arc<dyn ParameterStore>,
    pub deployer: Option<Arc<dyn Deployer>>,
    pub clock: Arc<dyn Clock>,
    pub resources: SharedResources,
}

impl PipelineBackends {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        registry: Arc<dyn ImageRegistry>,
        parameters: Arc<dyn ParameterStore>,
        resources: SharedResources,
    ) -> Self {
        Self {
            source,
            registry,
            parameters,
            deployer: None,
            clock: Arc::new(SystemClock::new()),
            resources,
        }
    }

    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Requests cancellation of a run. Honored only between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A started pipeline run.
pub struct PipelineRun {
    pub events: mpsc::Receiver<PipelineEvent>,
    pub handle: tokio::task::JoinHandle<PipelineResult>,
    pub cancel: CancelHandle,
}

impl PipelineRun {
    /// Discard events and wait for the result.
    pub async fn wait(self) -> Result<PipelineResult> {
        drop(self.events);
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("pipeline task failed: {}", e)))
    }
}

/// Orchestrates the execution of a pipeline.
pub struct PipelineOrchestrator {
    backends: PipelineBackends,
    stacks: Option<watch::Receiver<StackSnapshot>>,
    gate_timeout: Duration,
}

impl PipelineOrchestrator {
    pub fn new(backends: PipelineBackends) -> Self {
        Self {
            backends,
            stacks: None,
            gate_timeout: DEFAULT_STACK_GATE_TIMEOUT,
        }
    }

    /// Hold each run until the stacks it requires are provisioned.
    pub fn with_stack_gate(mut self, stacks: watch::Receiver<StackSnapshot>, timeout: Duration) -> Self {
        self.stacks = Some(stacks);
        self.gate_timeout = timeout;
        self
    }

    /// Validate and start a pipeline, returning a channel of events and a
    /// handle to get the final result.
    ///
    /// Definition errors are returned here, before any stage runs.
    pub fn execute(&self, spec: &PipelineSpec) -> Result<PipelineRun> {
        spec.validate()?;
        if spec.has_deploy() && self.backends.deployer.is_none() {
            return Err(Error::InvalidInput(format!(
                "pipeline '{}' has a deploy stage but no deployer is configured",
                spec.name
            )));
        }

        let (tx, rx) = mpsc::channel(100);
        let cancel = CancelHandle::new();
        let execution = PipelineExecution::new(self.backends.clone(), spec.clone(), tx);
        let gate = self
            .stacks
            .clone()
            .map(|stacks| (stacks, self.gate_timeout));
        let token = cancel.clone();

        let handle = tokio::spawn(async move { execution.run(gate, token).await });

        Ok(PipelineRun {
            events: rx,
            handle,
            cancel,
        })
    }

    /// Run a pipeline to completion.
    pub async fn run(&self, spec: &PipelineSpec) -> Result<PipelineResult> {
        self.execute(spec)?.wait().await
    }
}

/// Per-run state. Channels are wired up front so every consumer holds its
/// subscription before any producer runs.
struct PipelineExecution {
    backends: PipelineBackends,
    spec: PipelineSpec,
    channels: HashMap<String, ArtifactChannel>,
    inputs: HashMap<String, ArtifactSubscription>,
    events: mpsc::Sender<PipelineEvent>,
    stage_states: HashMap<String, StageState>,
    source: Option<SourceRevision>,
    builds: Vec<BuildExecution>,
    deployment: Option<DeploymentReceipt>,
}

impl PipelineExecution {
    fn new(backends: PipelineBackends, spec: PipelineSpec, events: mpsc::Sender<PipelineEvent>) -> Self {
        let channels: HashMap<String, ArtifactChannel> = spec
            .stages
            .iter()
            .filter_map(|s| s.output.clone())
            .map(|decl| (decl.name.clone(), ArtifactChannel::new(decl)))
            .collect();
        let inputs = spec
            .stages
            .iter()
            .filter_map(|s| {
                let decl = s.input.as_ref()?;
                let channel = channels.get(&decl.name)?;
                Some((s.name.clone(), channel.subscribe()))
            })
            .collect();
        let stage_states = spec
            .stages
            .iter()
            .map(|s| (s.name.clone(), StageState::Pending))
            .collect();

        Self {
            backends,
            spec,
            channels,
            inputs,
            events,
            stage_states,
            source: None,
            builds: Vec::new(),
            deployment: None,
        }
    }

    async fn run(
        mut self,
        gate: Option<(watch::Receiver<StackSnapshot>, Duration)>,
        cancel: CancelHandle,
    ) -> PipelineResult {
        let stages = self.spec.stages.clone();
        info!(pipeline = %self.spec.name, stages = stages.len(), "Pipeline started");

        let mut status = PipelineStatus::Pending;
        if let Some((mut stacks, timeout)) = gate {
            if let Err(e) = self.wait_for_stacks(&mut stacks, timeout).await {
                error!(pipeline = %self.spec.name, error = %e, "Required stacks not provisioned");
                let first = stages.first().map(|s| s.name.clone()).unwrap_or_default();
                self.stage_states.insert(
                    first.clone(),
                    StageState::Failed {
                        message: e.to_string(),
                    },
                );
                status = PipelineStatus::Failed {
                    stage: first,
                    message: e.to_string(),
                };
            }
        }

        for stage in &stages {
            if status.is_terminal() {
                if matches!(
                    self.stage_states.get(&stage.name),
                    Some(StageState::Failed { .. })
                ) {
                    continue;
                }
                let reason = match &status {
                    PipelineStatus::Cancelled => "pipeline cancelled".to_string(),
                    _ => "previous stage failed".to_string(),
                };
                self.stage_states
                    .insert(stage.name.clone(), StageState::Skipped { reason });
                continue;
            }

            // Cancellation checkpoint
            if cancel.is_cancelled() {
                info!(pipeline = %self.spec.name, stage = %stage.name, "Pipeline cancelled");
                status = PipelineStatus::Cancelled;
                self.stage_states.insert(
                    stage.name.clone(),
                    StageState::Skipped {
                        reason: "pipeline cancelled".to_string(),
                    },
                );
                continue;
            }

            status = PipelineStatus::Running {
                stage: stage.name.clone(),
            };
            match self.run_with_retry(stage).await {
                Ok(()) => {
                    info!(stage = %stage.name, "Stage completed successfully");
                    self.stage_states
                        .insert(stage.name.clone(), StageState::Succeeded);
                    self.emit(PipelineEvent::StageCompleted {
                        stage: stage.name.clone(),
                        success: true,
                    })
                    .await;
                }
                Err(e) => {
                    error!(stage = %stage.name, error = %e, "Stage failed");
                    self.stage_states.insert(
                        stage.name.clone(),
                        StageState::Failed {
                            message: e.to_string(),
                        },
                    );
                    self.emit(PipelineEvent::StageCompleted {
                        stage: stage.name.clone(),
                        success: false,
                    })
                    .await;
                    status = PipelineStatus::Failed {
                        stage: stage.name.clone(),
                        message: e.to_string(),
                    };
                }
            }
        }

        if !status.is_terminal() {
            status = PipelineStatus::Succeeded;
        }
        info!(pipeline = %self.spec.name, status = ?status, "Pipeline completed");
        self.emit(PipelineEvent::PipelineCompleted {
            status: status.clone(),
        })
        .await;

        let artifacts = self
            .channels
            .values()
            .filter_map(|channel| channel.subscribe().get().ok())
            .map(|artifact| (artifact.name.clone(), artifact))
            .collect();

        PipelineResult {
            pipeline: self.spec.name,
            status,
            stage_states: self.stage_states,
            source: self.source,
            builds: self.builds,
            deployment: self.deployment,
            artifacts,
        }
    }

    /// Run a stage, retrying retryable failures per the pipeline's policy.
    async fn run_with_retry(&mut self, stage: &StageSpec) -> Result<()> {
        let policy = self.spec.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.stage_states
                .insert(stage.name.clone(), StageState::Running { attempt });
            self.emit(PipelineEvent::StageStarted {
                stage: stage.name.clone(),
                attempt,
            })
            .await;

            match self.run_stage(stage).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                    let delay = policy.backoff(attempt - 1);
                    warn!(
                        stage = %stage.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage failed, retrying"
                    );
                    self.emit(PipelineEvent::StageRetrying {
                        stage: stage.name.clone(),
                        attempt,
                        delay,
                        error: e.to_string(),
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_stage(&mut self, stage: &StageSpec) -> Result<()> {
        info!(pipeline = %self.spec.name, stage = %stage.name, kind = %stage.kind(), "Running stage");
        match &stage.action {
            StageAction::Source => {
                let revision = self.backends.source.resolve(&self.spec.source).await?;
                if let Some(decl) = &stage.output {
                    let artifact = Artifact::new(
                        decl.name.clone(),
                        stage.name.clone(),
                        ArtifactPayload::Source(revision.clone()),
                    )?
                    .with_metadata("commit", revision.commit.clone());
                    self.channel(decl)?.publish(artifact)?;
                }
                self.source = Some(revision);
                Ok(())
            }
            StageAction::Build(_) => {
                let input = self.input(stage)?.get()?;
                let revision =
                    input
                        .source_revision()
                        .cloned()
                        .ok_or_else(|| Error::ArtifactTypeMismatch {
                            stage: stage.name.clone(),
                            expected: "source".to_string(),
                            found: input.decl().to_string(),
                        })?;

                let (target, environment) = {
                    let resources = self.backends.resources.read().await;
                    (
                        resources.registry(&self.spec.registry)?,
                        resources.environment().clone(),
                    )
                };
                let output = match &stage.output {
                    Some(decl) => Some(self.channel(decl)?),
                    None => None,
                };

                let outcome = BuildStage::new(&self.spec, stage, target, &environment, &self.backends)?
                    .with_events(&self.events)
                    .run(&revision, output)
                    .await;
                match outcome {
                    Ok(execution) => {
                        self.builds.push(execution);
                        Ok(())
                    }
                    Err(failure) => {
                        self.builds.extend(failure.execution);
                        Err(failure.error)
                    }
                }
            }
            StageAction::Deploy(_) => {
                let deployer = self.backends.deployer.clone().ok_or_else(|| {
                    Error::InvalidInput(format!("no deployer for stage '{}'", stage.name))
                })?;
                let input = self
                    .inputs
                    .get_mut(&stage.name)
                    .ok_or_else(|| Error::NotReady(stage.name.clone()))?;
                let receipt = DeployStage::new(stage, deployer.as_ref())?.run(input).await?;
                self.deployment = Some(receipt);
                Ok(())
            }
        }
    }

    /// Wait until every required stack is provisioned, one of them fails, or
    /// provisioning finishes without them.
    async fn wait_for_stacks(
        &self,
        stacks: &mut watch::Receiver<StackSnapshot>,
        timeout: Duration,
    ) -> Result<()> {
        let required = &self.spec.requires;
        if required.is_empty() {
            return Ok(());
        }
        info!(pipeline = %self.spec.name, ?required, "Waiting for required stacks");

        let unmet = match tokio::time::timeout(
            timeout,
            stacks.wait_for(|snapshot| snapshot.settled(required)),
        )
        .await
        {
            Ok(Ok(snapshot)) => snapshot.unmet(required),
            Ok(Err(_)) => {
                return Err(Error::Internal("stack status channel closed".to_string()));
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "waiting for stacks {}",
                    required.join(", ")
                )));
            }
        };

        if unmet.is_empty() {
            Ok(())
        } else {
            Err(Error::PrerequisiteNotMet {
                node: self.spec.name.clone(),
                missing: unmet,
            })
        }
    }

    fn channel(&self, decl: &ArtifactDecl) -> Result<&ArtifactChannel> {
        self.channels
            .get(&decl.name)
            .ok_or_else(|| Error::Internal(format!("no channel for artifact '{}'", decl.name)))
    }

    fn input(&self, stage: &StageSpec) -> Result<&ArtifactSubscription> {
        self.inputs
            .get(&stage.name)
            .ok_or_else(|| Error::NotReady(stage.name.clone()))
    }

    async fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event).await;
    }
}
