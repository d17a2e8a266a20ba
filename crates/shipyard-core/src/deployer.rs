//! Deployer trait and deployment types.
//!
//! Deployers roll a pushed image out to a running service. An in-pipeline
//! Deploy stage receives the image from the Build stage's artifact; an
//! out-of-pipeline deploy process reads it from the parameter store instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::ImageReference;
use crate::{ResourceId, Result};

/// Where an image is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTarget {
    /// Service name being deployed.
    pub service: String,
    /// Cluster the service runs in, if any.
    pub cluster: Option<String>,
}

/// Handle to a completed rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReceipt {
    pub id: ResourceId,
    pub deployer_name: String,
    pub target: DeployTarget,
    pub image: ImageReference,
    pub deployed_at: DateTime<Utc>,
}

/// Trait for deployers.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer.
    fn name(&self) -> &'static str;

    /// Roll the image out to the target and wait until it is serving.
    async fn deploy(&self, target: &DeployTarget, image: &ImageReference)
    -> Result<DeploymentReceipt>;
}
