//! Stack dependency graph.
//!
//! A stack is a named, independently provisionable unit of infrastructure
//! (network, cluster, registry, pipeline) with declared prerequisites. The
//! graph rejects cycles at registration time, yields a deterministic
//! provisioning order, and guards status transitions so a stack is never
//! provisioned before everything it depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::resource::{ResourceKind, ResourceRegistry};
use crate::{Error, Result};

/// What a stack provisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StackKind {
    Network { cidr: String, vpc_name: String },
    Cluster { cluster_name: String },
    Registry { repository: String },
    Pipeline { application: String },
}

impl StackKind {
    /// Kind of the resource this stack produces.
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            StackKind::Network { .. } => ResourceKind::Network,
            StackKind::Cluster { .. } => ResourceKind::Cluster,
            StackKind::Registry { .. } => ResourceKind::Registry,
            StackKind::Pipeline { .. } => ResourceKind::Pipeline,
        }
    }

    /// Name the produced resource is registered under.
    pub fn resource_name(&self) -> &str {
        match self {
            StackKind::Network { vpc_name, .. } => vpc_name,
            StackKind::Cluster { cluster_name } => cluster_name,
            StackKind::Registry { repository } => repository,
            StackKind::Pipeline { application } => application,
        }
    }
}

/// Provisioning status of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Pending,
    Provisioning,
    Provisioned,
    Failed,
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackStatus::Pending => write!(f, "pending"),
            StackStatus::Provisioning => write!(f, "provisioning"),
            StackStatus::Provisioned => write!(f, "provisioned"),
            StackStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackNode {
    pub name: String,
    pub kind: StackKind,
    /// Names of stacks that must be provisioned first.
    pub prerequisites: Vec<String>,
    pub status: StackStatus,
}

/// Directed acyclic graph of stacks, in registration order.
#[derive(Debug, Clone, Default)]
pub struct StackGraph {
    nodes: Vec<StackNode>,
    index: HashMap<String, usize>,
}

impl StackGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stack. Prerequisites may name stacks registered later.
    ///
    /// Fails with [`Error::Cycle`] if the new edges would close a cycle; the
    /// graph is unchanged on any error.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        kind: StackKind,
        prerequisites: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(Error::Conflict(format!("stack '{}' already registered", name)));
        }

        let mut deduped: Vec<String> = Vec::new();
        for prerequisite in prerequisites {
            let prerequisite = prerequisite.into();
            if !deduped.contains(&prerequisite) {
                deduped.push(prerequisite);
            }
        }

        for prerequisite in &deduped {
            self.check_edge(&name, prerequisite)?;
        }

        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(StackNode {
            name,
            kind,
            prerequisites: deduped,
            status: StackStatus::Pending,
        });
        Ok(())
    }

    /// Declare that `node` depends on `prerequisite`.
    pub fn add_dependency(&mut self, node: &str, prerequisite: &str) -> Result<()> {
        let idx = self.position(node)?;
        if self.nodes[idx].status != StackStatus::Pending {
            return Err(Error::Conflict(format!(
                "stack '{}' is {}; dependencies are fixed",
                node, self.nodes[idx].status
            )));
        }
        if self.nodes[idx].prerequisites.iter().any(|p| p == prerequisite) {
            return Ok(());
        }
        self.check_edge(node, prerequisite)?;
        self.nodes[idx].prerequisites.push(prerequisite.to_string());
        Ok(())
    }

    /// Reject `node -> prerequisite` if `node` is reachable from `prerequisite`.
    fn check_edge(&self, node: &str, prerequisite: &str) -> Result<()> {
        if node == prerequisite {
            return Err(Error::Cycle {
                node: node.to_string(),
                path: format!("{} -> {}", node, node),
            });
        }
        if let Some(path) = self.find_path(prerequisite, node) {
            return Err(Error::Cycle {
                node: node.to_string(),
                path: format!("{} -> {}", node, path.join(" -> ")),
            });
        }
        Ok(())
    }

    /// Depth-first search along prerequisite edges from `from` to `to`.
    fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![from.to_string()]];
        let mut seen = BTreeSet::new();

        while let Some(path) = stack.pop() {
            let Some(current) = path.last() else {
                continue;
            };
            if current == to {
                return Some(path);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(&idx) = self.index.get(current) {
                for prerequisite in self.nodes[idx].prerequisites.iter().rev() {
                    let mut next = path.clone();
                    next.push(prerequisite.clone());
                    stack.push(next);
                }
            }
        }
        None
    }

    /// Topologically sorted stack names. Independent stacks keep
    /// registration order.
    pub fn provision_order(&self) -> Result<Vec<String>> {
        let mut remaining: Vec<usize> = Vec::with_capacity(self.nodes.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            for prerequisite in &node.prerequisites {
                let &p = self.index.get(prerequisite).ok_or_else(|| {
                    Error::NotFound(format!(
                        "stack '{}' requires unknown stack '{}'",
                        node.name, prerequisite
                    ))
                })?;
                dependents[p].push(idx);
            }
            remaining.push(node.prerequisites.len());
        }

        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| idx)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = ready.pop_first() {
            order.push(self.nodes[idx].name.clone());
            for &dependent in &dependents[idx] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            // Registration rejects cycles, so this is unreachable in practice.
            let stuck = self
                .nodes
                .iter()
                .find(|n| !order.contains(&n.name))
                .map(|n| n.name.clone())
                .unwrap_or_default();
            return Err(Error::Cycle {
                path: stuck.clone(),
                node: stuck,
            });
        }
        Ok(order)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("stack '{}'", name)))
    }

    pub fn node(&self, name: &str) -> Result<&StackNode> {
        Ok(&self.nodes[self.position(name)?])
    }

    pub fn status(&self, name: &str) -> Result<StackStatus> {
        Ok(self.node(name)?.status)
    }

    /// Stacks in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &StackNode> {
        self.nodes.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stacks that list `name` as a prerequisite.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.prerequisites.iter().any(|p| p == name))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Prerequisites of `name` that are not yet provisioned.
    pub fn unmet_prerequisites(&self, name: &str) -> Result<Vec<String>> {
        let node = self.node(name)?;
        Ok(node
            .prerequisites
            .iter()
            .filter(|p| {
                self.index
                    .get(p.as_str())
                    .map(|&idx| self.nodes[idx].status != StackStatus::Provisioned)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    fn require_prerequisites(&self, name: &str) -> Result<()> {
        let missing = self.unmet_prerequisites(name)?;
        if !missing.is_empty() {
            return Err(Error::PrerequisiteNotMet {
                node: name.to_string(),
                missing,
            });
        }
        Ok(())
    }

    /// Pending -> Provisioning, once every prerequisite is provisioned.
    pub fn begin_provisioning(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        if self.nodes[idx].status != StackStatus::Pending {
            return Err(Error::Conflict(format!(
                "stack '{}' is {}, not pending",
                name, self.nodes[idx].status
            )));
        }
        self.require_prerequisites(name)?;
        self.nodes[idx].status = StackStatus::Provisioning;
        Ok(())
    }

    /// Pending/Provisioning -> Provisioned, once every prerequisite is
    /// provisioned. Repeating the call on a provisioned stack is a no-op.
    pub fn mark_provisioned(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        match self.nodes[idx].status {
            StackStatus::Provisioned => return Ok(()),
            StackStatus::Failed => {
                return Err(Error::Conflict(format!("stack '{}' has failed", name)));
            }
            StackStatus::Pending | StackStatus::Provisioning => {}
        }
        self.require_prerequisites(name)?;
        self.nodes[idx].status = StackStatus::Provisioned;
        Ok(())
    }

    pub fn mark_failed(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        if self.nodes[idx].status == StackStatus::Provisioned {
            return Err(Error::Conflict(format!(
                "stack '{}' is already provisioned",
                name
            )));
        }
        self.nodes[idx].status = StackStatus::Failed;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.status == StackStatus::Provisioned)
    }
}

/// A resource produced by provisioning a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub kind: ResourceKind,
    pub name: String,
    /// Provider identifier.
    pub id: String,
}

/// Trait for stack provisioning backends.
#[async_trait]
pub trait StackProvisioner: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Provision one stack. `resources` is a snapshot that already holds the
    /// handles of every prerequisite.
    async fn provision(
        &self,
        node: &StackNode,
        resources: &ResourceRegistry,
    ) -> Result<Vec<ProvisionedResource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> StackKind {
        StackKind::Network {
            cidr: "192.168.0.0/16".into(),
            vpc_name: "EksVpc".into(),
        }
    }

    fn cluster() -> StackKind {
        StackKind::Cluster {
            cluster_name: "EksCluster".into(),
        }
    }

    fn registry(name: &str) -> StackKind {
        StackKind::Registry {
            repository: name.into(),
        }
    }

    fn none() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn test_order_puts_prerequisites_first() {
        let mut graph = StackGraph::new();
        graph.register("pipeline", registry("p"), ["cluster", "registry"]).unwrap();
        graph.register("cluster", cluster(), ["network"]).unwrap();
        graph.register("registry", registry("r"), none()).unwrap();
        graph.register("network", network(), none()).unwrap();

        let order = graph.provision_order().unwrap();
        assert_eq!(order.len(), 4);
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("network") < pos("cluster"));
        assert!(pos("cluster") < pos("pipeline"));
        assert!(pos("registry") < pos("pipeline"));
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let mut graph = StackGraph::new();
        graph.register("c", registry("c"), none()).unwrap();
        graph.register("a", registry("a"), none()).unwrap();
        graph.register("b", registry("b"), ["c"]).unwrap();
        graph.register("d", registry("d"), none()).unwrap();

        assert_eq!(graph.provision_order().unwrap(), vec!["c", "a", "b", "d"]);
        // Stable across calls.
        assert_eq!(graph.provision_order().unwrap(), graph.provision_order().unwrap());
    }

    #[test]
    fn test_order_lists_each_node_once_for_diamond() {
        let mut graph = StackGraph::new();
        graph.register("net", network(), none()).unwrap();
        graph.register("left", registry("l"), ["net"]).unwrap();
        graph.register("right", registry("r"), ["net"]).unwrap();
        graph.register("top", registry("t"), ["left", "right", "net"]).unwrap();

        assert_eq!(
            graph.provision_order().unwrap(),
            vec!["net", "left", "right", "top"]
        );
    }

    #[test]
    fn test_cycle_rejected_without_mutation() {
        let mut graph = StackGraph::new();
        graph.register("a", registry("a"), ["b"]).unwrap();
        graph.register("b", registry("b"), ["c"]).unwrap();

        let err = graph.register("c", registry("c"), ["a"]).unwrap_err();
        match err {
            Error::Cycle { node, path } => {
                assert_eq!(node, "c");
                assert_eq!(path, "c -> a -> b -> c");
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        assert_eq!(graph.len(), 2);
        assert!(!graph.contains("c"));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut graph = StackGraph::new();
        assert!(matches!(
            graph.register("a", registry("a"), ["a"]),
            Err(Error::Cycle { .. })
        ));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_add_dependency_cycle_leaves_graph_unchanged() {
        let mut graph = StackGraph::new();
        graph.register("network", network(), none()).unwrap();
        graph.register("cluster", cluster(), none()).unwrap();
        graph.add_dependency("cluster", "network").unwrap();

        let err = graph.add_dependency("network", "cluster").unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
        assert!(graph.node("network").unwrap().prerequisites.is_empty());
        assert_eq!(graph.provision_order().unwrap(), vec!["network", "cluster"]);
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let mut graph = StackGraph::new();
        graph.register("network", network(), none()).unwrap();
        assert!(matches!(
            graph.register("network", network(), none()),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_unknown_prerequisite_fails_ordering() {
        let mut graph = StackGraph::new();
        graph.register("cluster", cluster(), ["network"]).unwrap();
        assert!(matches!(graph.provision_order(), Err(Error::NotFound(_))));

        graph.register("network", network(), none()).unwrap();
        assert_eq!(graph.provision_order().unwrap(), vec!["network", "cluster"]);
    }

    #[test]
    fn test_mark_provisioned_requires_prerequisites() {
        let mut graph = StackGraph::new();
        graph.register("network", network(), none()).unwrap();
        graph.register("cluster", cluster(), ["network"]).unwrap();
        graph.register("registry", registry("r"), none()).unwrap();

        let err = graph.mark_provisioned("cluster").unwrap_err();
        assert_eq!(
            err,
            Error::PrerequisiteNotMet {
                node: "cluster".into(),
                missing: vec!["network".into()],
            }
        );
        assert_eq!(graph.status("cluster").unwrap(), StackStatus::Pending);

        graph.mark_provisioned("registry").unwrap();
        graph.begin_provisioning("network").unwrap();
        assert_eq!(graph.status("network").unwrap(), StackStatus::Provisioning);
        graph.mark_provisioned("network").unwrap();
        graph.mark_provisioned("cluster").unwrap();
        assert!(graph.is_complete());
    }

    #[test]
    fn test_begin_provisioning_guards_status_and_prerequisites() {
        let mut graph = StackGraph::new();
        graph.register("network", network(), none()).unwrap();
        graph.register("cluster", cluster(), ["network"]).unwrap();

        assert!(matches!(
            graph.begin_provisioning("cluster"),
            Err(Error::PrerequisiteNotMet { .. })
        ));
        graph.begin_provisioning("network").unwrap();
        assert!(matches!(
            graph.begin_provisioning("network"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_failed_stack_blocks_dependents() {
        let mut graph = StackGraph::new();
        graph.register("network", network(), none()).unwrap();
        graph.register("cluster", cluster(), ["network"]).unwrap();

        graph.begin_provisioning("network").unwrap();
        graph.mark_failed("network").unwrap();
        assert_eq!(graph.unmet_prerequisites("cluster").unwrap(), vec!["network"]);
        assert!(graph.mark_provisioned("network").is_err());
        assert_eq!(graph.dependents("network"), vec!["cluster"]);
    }
}
