//! Resource registry: named handles to infrastructure provisioned outside the
//! pipeline core (networks, clusters, container registries, source connections).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::registry::RegistryCoordinate;
use crate::{Error, Result};

/// Account and region every resource in a topology lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployEnvironment {
    pub account: String,
    pub region: String,
}

impl DeployEnvironment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }

    /// Host of the account's private container registry.
    pub fn registry_host(&self) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com", self.account, self.region)
    }

    /// Build an ARN for a resource in this environment.
    pub fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, self.account, resource
        )
    }
}

/// Kind of externally provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
    Cluster,
    Registry,
    Connection,
    Pipeline,
}

impl ResourceKind {
    fn arn_parts(&self, id: &str) -> (&'static str, String) {
        match self {
            ResourceKind::Network => ("ec2", format!("vpc/{}", id)),
            ResourceKind::Cluster => ("eks", format!("cluster/{}", id)),
            ResourceKind::Registry => ("ecr", format!("repository/{}", id)),
            ResourceKind::Connection => ("codestar-connections", format!("connection/{}", id)),
            ResourceKind::Pipeline => ("codepipeline", id.to_string()),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Cluster => write!(f, "cluster"),
            ResourceKind::Registry => write!(f, "registry"),
            ResourceKind::Connection => write!(f, "connection"),
            ResourceKind::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "network" => Ok(ResourceKind::Network),
            "cluster" => Ok(ResourceKind::Cluster),
            "registry" => Ok(ResourceKind::Registry),
            "connection" => Ok(ResourceKind::Connection),
            "pipeline" => Ok(ResourceKind::Pipeline),
            other => Err(Error::InvalidInput(format!("unknown resource kind: {}", other))),
        }
    }
}

/// Where a handle came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceOrigin {
    /// Declared by name only; exists independently of this topology.
    Imported,
    /// Produced by provisioning the named stack.
    Provisioned { stack: String },
}

/// Opaque handle to a provisioned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub name: String,
    pub kind: ResourceKind,
    /// Provider identifier (VPC id, cluster name, repository name, ...).
    pub id: String,
    pub arn: String,
    pub origin: ResourceOrigin,
}

/// Lookup table of resource handles, keyed by kind and name.
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    environment: DeployEnvironment,
    handles: BTreeMap<(ResourceKind, String), ResourceHandle>,
}

impl ResourceRegistry {
    pub fn new(environment: DeployEnvironment) -> Self {
        Self {
            environment,
            handles: BTreeMap::new(),
        }
    }

    pub fn environment(&self) -> &DeployEnvironment {
        &self.environment
    }

    /// Register a resource that already exists, deriving its ARN from the
    /// environment. The provider id is the name itself.
    pub fn import(&mut self, kind: ResourceKind, name: impl Into<String>) -> Result<&ResourceHandle> {
        let name = name.into();
        let (service, resource) = kind.arn_parts(&name);
        let handle = ResourceHandle {
            arn: self.environment.arn(service, &resource),
            id: name.clone(),
            name,
            kind,
            origin: ResourceOrigin::Imported,
        };
        self.insert(handle)
    }

    /// Register a handle produced by provisioning a stack.
    pub fn provisioned(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        id: impl Into<String>,
        stack: impl Into<String>,
    ) -> Result<&ResourceHandle> {
        let id = id.into();
        let (service, resource) = kind.arn_parts(&id);
        let handle = ResourceHandle {
            arn: self.environment.arn(service, &resource),
            name: name.into(),
            id,
            kind,
            origin: ResourceOrigin::Provisioned {
                stack: stack.into(),
            },
        };
        self.insert(handle)
    }

    /// Insert a handle. Names are unique per kind.
    pub fn insert(&mut self, handle: ResourceHandle) -> Result<&ResourceHandle> {
        let key = (handle.kind, handle.name.clone());
        if self.handles.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "{} '{}' already registered",
                handle.kind, handle.name
            )));
        }
        Ok(self.handles.entry(key).or_insert(handle))
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Result<&ResourceHandle> {
        self.handles
            .get(&(kind, name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("{} '{}'", kind, name)))
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.handles.contains_key(&(kind, name.to_string()))
    }

    pub fn network(&self, name: &str) -> Result<&ResourceHandle> {
        self.get(ResourceKind::Network, name)
    }

    pub fn cluster(&self, name: &str) -> Result<&ResourceHandle> {
        self.get(ResourceKind::Cluster, name)
    }

    /// Resolve a registry name to the coordinate images are pushed to.
    pub fn registry(&self, name: &str) -> Result<RegistryCoordinate> {
        let handle = self.get(ResourceKind::Registry, name)?;
        Ok(RegistryCoordinate {
            host: self.environment.registry_host(),
            repository: handle.id.clone(),
        })
    }

    /// All handles of one kind, ordered by name.
    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceHandle> {
        self.handles
            .iter()
            .filter(move |((k, _), _)| *k == kind)
            .map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
