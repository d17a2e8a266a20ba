//! Deploy stage runner.

use shipyard_core::artifact::{ArtifactKind, ArtifactSubscription};
use shipyard_core::deployer::{Deployer, DeploymentReceipt};
use shipyard_core::pipeline::{DeploySettings, StageAction, StageSpec};
use shipyard_core::{Error, Result};
use tracing::info;

/// Rolls out the image a Build stage published.
pub struct DeployStage<'a> {
    stage: &'a StageSpec,
    settings: &'a DeploySettings,
    deployer: &'a dyn Deployer,
}

impl<'a> DeployStage<'a> {
    pub fn new(stage: &'a StageSpec, deployer: &'a dyn Deployer) -> Result<Self> {
        let StageAction::Deploy(settings) = &stage.action else {
            return Err(Error::InvalidInput(format!(
                "stage '{}' is not a deploy stage",
                stage.name
            )));
        };
        Ok(Self {
            stage,
            settings,
            deployer,
        })
    }

    /// Wait for the build artifact, then deploy exactly the image it names.
    pub async fn run(&self, input: &mut ArtifactSubscription) -> Result<DeploymentReceipt> {
        let artifact = input.wait_timeout(self.settings.timeout).await?;
        let build = artifact.build().ok_or_else(|| Error::ArtifactTypeMismatch {
            stage: self.stage.name.clone(),
            expected: ArtifactKind::Image.to_string(),
            found: artifact.decl().to_string(),
        })?;
        let image = build.image().ok_or_else(|| {
            Error::InvalidInput(format!("build {} published without a pushed image", build.id))
        })?;

        info!(
            stage = %self.stage.name,
            service = %self.settings.target.service,
            image = %image,
            deployer = self.deployer.name(),
            "Deploying image"
        );
        self.deployer.deploy(&self.settings.target, &image).await
    }
}
