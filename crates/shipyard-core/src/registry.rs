//! Container registry interface.
//!
//! The pipeline core never builds or pushes images itself; it drives an
//! [`ImageRegistry`] backend through the ordered build steps.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Result;

/// Where images for one repository are pushed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryCoordinate {
    /// Registry host (e.g., "123456789012.dkr.ecr.us-east-1.amazonaws.com").
    pub host: String,
    /// Repository within the registry.
    pub repository: String,
}

impl RegistryCoordinate {
    /// Reference an image in this repository.
    pub fn image(&self, tag: impl Into<String>) -> ImageReference {
        ImageReference {
            host: self.host.clone(),
            repository: self.repository.clone(),
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for RegistryCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)
    }
}

/// Fully qualified, tagged image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn coordinate(&self) -> RegistryCoordinate {
        RegistryCoordinate {
            host: self.host.clone(),
            repository: self.repository.clone(),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repository, self.tag)
    }
}

/// Request to build an image from a checked-out source tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBuildRequest {
    /// Local name the image is built under before tagging (e.g., "flask-app:abc-123").
    pub local_name: String,
    /// Build context directory relative to the checkout.
    pub context: String,
    /// Dockerfile path relative to the checkout.
    pub dockerfile: String,
    /// Source revision the build runs against.
    pub revision: String,
    /// Resolved build environment. Store-backed values are already substituted.
    pub env: BTreeMap<String, String>,
    /// Run the build with elevated privileges (needed for docker-in-docker).
    pub privileged: bool,
}

/// A locally built, not yet pushed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub local_name: String,
    /// Content digest reported by the builder.
    pub digest: String,
}

/// Confirmation of a successful push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReceipt {
    pub reference: ImageReference,
    pub digest: String,
}

/// Trait for container registry backends.
///
/// Failures are reported as [`crate::Error::Auth`] or [`crate::Error::Network`]
/// so the owning pipeline can apply its retry policy.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Authenticate against the registry host.
    async fn authenticate(&self, target: &RegistryCoordinate) -> Result<()>;

    /// Build an image.
    async fn build(&self, request: &ImageBuildRequest) -> Result<BuiltImage>;

    /// Apply a remote reference to a built image.
    async fn tag(&self, image: &BuiltImage, reference: &ImageReference) -> Result<()>;

    /// Push a tagged image.
    async fn push(&self, image: &BuiltImage, reference: &ImageReference) -> Result<PushReceipt>;
}
