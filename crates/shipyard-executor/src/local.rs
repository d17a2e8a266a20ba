//! Local provisioning and deployment backends.
//!
//! Nothing here talks to a cloud provider. Provisioning hands out
//! deterministic identifiers so a full topology can be exercised end to end.

use async_trait::async_trait;
use chrono::Utc;
use shipyard_core::deployer::{DeployTarget, Deployer, DeploymentReceipt};
use shipyard_core::registry::ImageReference;
use shipyard_core::resource::{ResourceKind, ResourceRegistry};
use shipyard_core::stack::{ProvisionedResource, StackKind, StackNode, StackProvisioner};
use shipyard_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use crate::digest_of;

/// Provisioner that fabricates resource identifiers locally.
#[derive(Debug, Default)]
pub struct LocalProvisioner {
    delay: Option<Duration>,
    failures: Mutex<HashMap<String, Error>>,
    started: Mutex<Vec<String>>,
}

impl LocalProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every stack take this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail provisioning of `stack` with `error`.
    pub fn fail_stack(&self, stack: impl Into<String>, error: Error) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(stack.into(), error);
        }
    }

    /// Stacks in the order provisioning started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn resource_id(node: &StackNode) -> String {
        let digest = digest_of(&[&node.name, node.kind.resource_name()]);
        let short = digest.trim_start_matches("sha256:").get(..17).unwrap_or_default();
        match &node.kind {
            StackKind::Network { .. } => format!("vpc-{}", short),
            StackKind::Cluster { cluster_name } => cluster_name.clone(),
            StackKind::Registry { repository } => repository.clone(),
            StackKind::Pipeline { application } => {
                format!("{}-{}", application, short.get(..8).unwrap_or(short))
            }
        }
    }
}

#[async_trait]
impl StackProvisioner for LocalProvisioner {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn provision(
        &self,
        node: &StackNode,
        resources: &ResourceRegistry,
    ) -> Result<Vec<ProvisionedResource>> {
        if let Ok(mut started) = self.started.lock() {
            started.push(node.name.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .failures
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .get(&node.name)
            .cloned();
        if let Some(error) = injected {
            return Err(error);
        }

        // A cluster is placed into a network, so one must already exist.
        if matches!(node.kind, StackKind::Cluster { .. })
            && resources.of_kind(ResourceKind::Network).next().is_none()
        {
            return Err(Error::PrerequisiteNotMet {
                node: node.name.clone(),
                missing: vec!["network".to_string()],
            });
        }

        let resource = ProvisionedResource {
            kind: node.kind.resource_kind(),
            name: node.kind.resource_name().to_string(),
            id: Self::resource_id(node),
        };
        info!(stack = %node.name, kind = %resource.kind, id = %resource.id, "Stack provisioned");
        Ok(vec![resource])
    }
}

/// Deployer that records rollouts instead of performing them.
#[derive(Debug, Default)]
pub struct RecordingDeployer {
    deployments: Mutex<Vec<DeploymentReceipt>>,
    failure: Mutex<Option<Error>>,
}

impl RecordingDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next rollout with `error`.
    pub fn fail_next(&self, error: Error) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(error);
        }
    }

    pub fn deployments(&self) -> Vec<DeploymentReceipt> {
        self.deployments.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Deployer for RecordingDeployer {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deploy(
        &self,
        target: &DeployTarget,
        image: &ImageReference,
    ) -> Result<DeploymentReceipt> {
        let injected = self
            .failure
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .take();
        if let Some(error) = injected {
            return Err(error);
        }

        let receipt = DeploymentReceipt {
            id: ResourceId::new(),
            deployer_name: self.name().to_string(),
            target: target.clone(),
            image: image.clone(),
            deployed_at: Utc::now(),
        };
        info!(service = %target.service, image = %image, "Deployment recorded");
        self.deployments
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .push(receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::resource::DeployEnvironment;
    use shipyard_core::stack::StackStatus;

    fn node(name: &str, kind: StackKind) -> StackNode {
        StackNode {
            name: name.into(),
            kind,
            prerequisites: vec![],
            status: StackStatus::Provisioning,
        }
    }

    fn resources() -> ResourceRegistry {
        ResourceRegistry::new(DeployEnvironment::new("123456789012", "us-east-1"))
    }

    #[tokio::test]
    async fn test_provision_network() {
        let provisioner = LocalProvisioner::new();
        let network = node(
            "EksNetworkStack",
            StackKind::Network {
                cidr: "192.168.0.0/16".into(),
                vpc_name: "EksVpc".into(),
            },
        );
        let produced = provisioner.provision(&network, &resources()).await.unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].kind, ResourceKind::Network);
        assert_eq!(produced[0].name, "EksVpc");
        assert!(produced[0].id.starts_with("vpc-"));

        // Deterministic across calls.
        let again = provisioner.provision(&network, &resources()).await.unwrap();
        assert_eq!(again[0].id, produced[0].id);
    }

    #[tokio::test]
    async fn test_cluster_needs_network() {
        let provisioner = LocalProvisioner::new();
        let cluster = node(
            "EksClusterStack",
            StackKind::Cluster {
                cluster_name: "EksCluster".into(),
            },
        );
        let result = provisioner.provision(&cluster, &resources()).await;
        assert!(matches!(result, Err(Error::PrerequisiteNotMet { .. })));

        let mut with_network = resources();
        with_network.import(ResourceKind::Network, "EksVpc").unwrap();
        let produced = provisioner.provision(&cluster, &with_network).await.unwrap();
        assert_eq!(produced[0].id, "EksCluster");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provisioner = LocalProvisioner::new();
        provisioner.fail_stack("EcrStack", Error::Network("throttled".into()));
        let registry = node(
            "EcrStack",
            StackKind::Registry {
                repository: "flask-app".into(),
            },
        );
        assert!(matches!(
            provisioner.provision(&registry, &resources()).await,
            Err(Error::Network(_))
        ));
        assert_eq!(provisioner.started(), vec!["EcrStack"]);
    }

    #[tokio::test]
    async fn test_recording_deployer() {
        let deployer = RecordingDeployer::new();
        let target = DeployTarget {
            service: "flask-service".into(),
            cluster: Some("EksCluster".into()),
        };
        let image = ImageReference {
            host: "123.dkr.ecr.us-east-1.amazonaws.com".into(),
            repository: "flask-app".into(),
            tag: "abc-1".into(),
        };

        deployer.fail_next(Error::Network("reset".into()));
        assert!(deployer.deploy(&target, &image).await.is_err());

        let receipt = deployer.deploy(&target, &image).await.unwrap();
        assert_eq!(receipt.image, image);
        assert_eq!(deployer.deployments().len(), 1);
    }
}
