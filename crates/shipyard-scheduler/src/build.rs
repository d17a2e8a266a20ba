//! Build stage runner.
//!
//! One run turns a source revision into a pushed image. The side effects
//! happen in a fixed order: authenticate, build, tag, push, write the tag to
//! the parameter store, publish the build artifact. A failure at any step
//! stops the run; the parameter write and the artifact only ever describe an
//! image that was fully pushed.

use shipyard_core::artifact::{Artifact, ArtifactChannel, ArtifactPayload};
use shipyard_core::build::BuildExecution;
use shipyard_core::pipeline::{BuildSettings, EnvBinding, PipelineSpec, StageAction, StageSpec};
use shipyard_core::registry::{ImageBuildRequest, RegistryCoordinate};
use shipyard_core::resource::DeployEnvironment;
use shipyard_core::source::SourceRevision;
use shipyard_core::{Error, Result};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{PipelineBackends, PipelineEvent};

/// Build variables every build receives.
pub const ACCOUNT_ID: &str = "ACCOUNT_ID";
pub const REGION: &str = "REGION";
pub const REPO_NAME: &str = "REPO_NAME";
pub const APP_NAME: &str = "APP_NAME";
pub const TAG: &str = "TAG";

/// A failed build run.
#[derive(Debug)]
pub struct BuildFailure {
    /// The failed execution, unless the run failed before one could start.
    pub execution: Option<BuildExecution>,
    pub error: Error,
}

/// Runs one Build stage attempt.
pub struct BuildStage<'a> {
    spec: &'a PipelineSpec,
    stage: &'a StageSpec,
    settings: &'a BuildSettings,
    target: RegistryCoordinate,
    environment: &'a DeployEnvironment,
    backends: &'a PipelineBackends,
    events: Option<&'a mpsc::Sender<PipelineEvent>>,
}

impl<'a> BuildStage<'a> {
    pub fn new(
        spec: &'a PipelineSpec,
        stage: &'a StageSpec,
        target: RegistryCoordinate,
        environment: &'a DeployEnvironment,
        backends: &'a PipelineBackends,
    ) -> Result<Self> {
        let StageAction::Build(settings) = &stage.action else {
            return Err(Error::InvalidInput(format!(
                "stage '{}' is not a build stage",
                stage.name
            )));
        };
        Ok(Self {
            spec,
            stage,
            settings,
            target,
            environment,
            backends,
            events: None,
        })
    }

    pub fn with_events(mut self, events: &'a mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build and push an image for `revision`, publishing to `output` if the
    /// stage declares one.
    pub async fn run(
        &self,
        revision: &SourceRevision,
        output: Option<&ArtifactChannel>,
    ) -> std::result::Result<BuildExecution, BuildFailure> {
        let mut execution = BuildExecution::start(
            &self.spec.application,
            &revision.commit,
            self.backends.clock.now(),
            self.target.clone(),
            &self.spec.parameter_key,
        )
        .map_err(|error| BuildFailure {
            execution: None,
            error,
        })?;

        info!(
            stage = %self.stage.name,
            app = %self.spec.application,
            build = %execution.id,
            tag = %execution.planned_tag(),
            "Build started"
        );

        match self.execute(&mut execution, revision, output).await {
            Ok(()) => {
                info!(stage = %self.stage.name, tag = %execution.planned_tag(), "Build succeeded");
                Ok(execution)
            }
            Err(error) => {
                error!(stage = %self.stage.name, build = %execution.id, error = %error, "Build failed");
                execution.fail(error.to_string(), self.backends.clock.now());
                Err(BuildFailure {
                    execution: Some(execution),
                    error,
                })
            }
        }
    }

    async fn execute(
        &self,
        execution: &mut BuildExecution,
        revision: &SourceRevision,
        output: Option<&ArtifactChannel>,
    ) -> Result<()> {
        let registry = &self.backends.registry;
        let reference = execution.planned_image();
        let env = self.build_env(execution).await?;

        registry.authenticate(&self.target).await?;

        let request = ImageBuildRequest {
            local_name: format!("{}:{}", self.target.repository, reference.tag),
            context: self.settings.context.clone(),
            dockerfile: self.settings.dockerfile.clone(),
            revision: revision.commit.clone(),
            env,
            privileged: self.settings.privileged,
        };
        let built = registry.build(&request).await?;
        debug!(image = %built.local_name, digest = %built.digest, "Image built");

        registry.tag(&built, &reference).await?;

        let receipt = registry.push(&built, &reference).await?;
        execution.record_push(&receipt)?;
        self.emit(PipelineEvent::ImagePushed {
            stage: self.stage.name.clone(),
            image: reference.to_string(),
            digest: receipt.digest.clone(),
        })
        .await;

        // Last-writer-wins: a concurrent build of the same application may
        // overwrite this value.
        self.backends
            .parameters
            .put(&execution.parameter_key, &reference.tag, true)
            .await?;
        self.emit(PipelineEvent::ParameterWritten {
            key: execution.parameter_key.clone(),
            value: reference.tag.clone(),
        })
        .await;

        execution.succeed(self.backends.clock.now())?;

        if let Some(channel) = output {
            let artifact = Artifact::new(
                channel.decl().name.clone(),
                self.stage.name.clone(),
                ArtifactPayload::Image(execution.clone()),
            )?
            .with_metadata("image", reference.to_string());
            channel.publish(artifact)?;
        }
        Ok(())
    }

    /// The stage's own bindings plus the contract variables. Contract
    /// variables always win over a binding of the same name. Store-backed
    /// bindings are read from the parameter store; only keys are logged.
    async fn build_env(&self, execution: &BuildExecution) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        for (key, binding) in &self.stage.env {
            let value = match binding {
                EnvBinding::Plaintext(value) => value.clone(),
                EnvBinding::Parameter(name) => {
                    self.backends.parameters.get(name).await.map_err(|e| match e {
                        Error::NotFound(_) => Error::NotFound(format!(
                            "parameter '{}' for build variable '{}'",
                            name, key
                        )),
                        other => other,
                    })?
                }
            };
            env.insert(key.clone(), value);
        }

        let contract = [
            (ACCOUNT_ID, self.environment.account.clone()),
            (REGION, self.environment.region.clone()),
            (REPO_NAME, self.target.repository.clone()),
            (APP_NAME, self.spec.application.clone()),
            (TAG, execution.tag_suffix.to_string()),
        ];
        for (key, value) in contract {
            if env.insert(key.to_string(), value).is_some() {
                warn!(stage = %self.stage.name, key, "Ignoring binding for a contract build variable");
            }
        }

        debug!(stage = %self.stage.name, keys = ?env.keys().collect::<Vec<_>>(), "Resolved build environment");
        Ok(env)
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(events) = self.events {
            let _ = events.send(event).await;
        }
    }
}
