//! Concurrent stack provisioning.
//!
//! Every stack whose prerequisites are provisioned is launched at once, so
//! unrelated subtrees proceed in parallel. Resources a stack produces are
//! registered before its status turns Provisioned, so anything gated on that
//! status can look them up.

use futures::FutureExt;
use shipyard_core::stack::{
    ProvisionedResource, StackGraph, StackNode, StackProvisioner, StackStatus,
};
use shipyard_core::{Error, Result};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::orchestrator::SharedResources;

/// Point-in-time view of stack statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSnapshot {
    pub statuses: BTreeMap<String, StackStatus>,
    /// True once provisioning has finished; Pending stacks will stay Pending.
    pub complete: bool,
}

impl StackSnapshot {
    pub fn from_graph(graph: &StackGraph, complete: bool) -> Self {
        Self {
            statuses: graph
                .nodes()
                .map(|node| (node.name.clone(), node.status))
                .collect(),
            complete,
        }
    }

    pub fn status(&self, name: &str) -> Option<StackStatus> {
        self.statuses.get(name).copied()
    }

    /// Whether waiting on `required` can end: all provisioned, any failed, or
    /// provisioning finished.
    pub fn settled(&self, required: &[String]) -> bool {
        self.complete
            || required
                .iter()
                .all(|name| self.status(name) == Some(StackStatus::Provisioned))
            || required
                .iter()
                .any(|name| self.status(name) == Some(StackStatus::Failed))
    }

    /// Required stacks that are not provisioned.
    pub fn unmet(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| self.status(name) != Some(StackStatus::Provisioned))
            .cloned()
            .collect()
    }
}

/// Outcome of provisioning a stack graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Provisioned stacks, in completion order.
    pub provisioned: Vec<String>,
    /// Failed stacks with their error, in completion order.
    pub failed: Vec<(String, String)>,
    /// Stacks never launched because a prerequisite failed or provisioning stopped.
    pub blocked: Vec<String>,
}

impl ProvisionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }

    pub fn first_failure(&self) -> Option<&(String, String)> {
        self.failed.first()
    }
}

/// Drives a [`StackProvisioner`] over a whole graph.
pub struct StackProvisioning {
    provisioner: Arc<dyn StackProvisioner>,
    resources: SharedResources,
    fail_fast: bool,
    status: watch::Sender<StackSnapshot>,
}

impl StackProvisioning {
    pub fn new(provisioner: Arc<dyn StackProvisioner>, resources: SharedResources) -> Self {
        let (status, _) = watch::channel(StackSnapshot::default());
        Self {
            provisioner,
            resources,
            fail_fast: false,
            status,
        }
    }

    /// Stop launching new stacks after the first failure. Stacks already in
    /// flight still finish.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Status updates, one snapshot per transition.
    pub fn subscribe(&self) -> watch::Receiver<StackSnapshot> {
        self.status.subscribe()
    }

    /// Provision every Pending stack in `graph`.
    pub async fn run(&self, graph: &mut StackGraph) -> Result<ProvisionReport> {
        let order = graph.provision_order()?;
        info!(
            provisioner = self.provisioner.name(),
            stacks = order.len(),
            "Provisioning stacks"
        );
        self.publish(graph, false);

        let mut report = ProvisionReport::default();
        let mut tasks = JoinSet::new();
        let mut halted = false;

        loop {
            if !halted {
                let ready: Vec<String> = order
                    .iter()
                    .filter(|name| graph.status(name).ok() == Some(StackStatus::Pending))
                    .filter(|name| {
                        graph
                            .unmet_prerequisites(name)
                            .map(|unmet| unmet.is_empty())
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();

                for name in &ready {
                    graph.begin_provisioning(name)?;
                    let node = graph.node(name)?.clone();
                    let snapshot = self.resources.read().await.clone();
                    let provisioner = self.provisioner.clone();
                    info!(stack = %name, "Provisioning stack");
                    tasks.spawn(async move {
                        let result = AssertUnwindSafe(provisioner.provision(&node, &snapshot))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(Error::Internal(format!(
                                    "provisioner panicked on stack '{}'",
                                    node.name
                                )))
                            });
                        (node, result)
                    });
                }
                if !ready.is_empty() {
                    self.publish(graph, false);
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (node, result) =
                joined.map_err(|e| Error::Internal(format!("provisioning task failed: {}", e)))?;

            let outcome = match result {
                Ok(produced) => self.register(&node, produced).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    graph.mark_provisioned(&node.name)?;
                    info!(stack = %node.name, "Stack provisioned");
                    report.provisioned.push(node.name);
                }
                Err(e) => {
                    error!(stack = %node.name, error = %e, "Stack provisioning failed");
                    graph.mark_failed(&node.name)?;
                    report.failed.push((node.name, e.to_string()));
                    if self.fail_fast && !halted {
                        warn!("Fail-fast enabled, not launching further stacks");
                        halted = true;
                    }
                }
            }
            self.publish(graph, false);
        }

        report.blocked = order
            .into_iter()
            .filter(|name| graph.status(name).ok() == Some(StackStatus::Pending))
            .collect();
        if !report.blocked.is_empty() {
            warn!(blocked = ?report.blocked, "Stacks left unprovisioned");
        }
        self.publish(graph, true);
        Ok(report)
    }

    async fn register(&self, node: &StackNode, produced: Vec<ProvisionedResource>) -> Result<()> {
        let mut resources = self.resources.write().await;
        for resource in produced {
            resources.provisioned(resource.kind, resource.name, resource.id, node.name.clone())?;
        }
        Ok(())
    }

    fn publish(&self, graph: &StackGraph, complete: bool) {
        self.status
            .send_replace(StackSnapshot::from_graph(graph, complete));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shipyard_core::resource::{DeployEnvironment, ResourceKind, ResourceRegistry};
    use shipyard_core::stack::StackKind;
    use shipyard_executor::LocalProvisioner;
    use std::time::Duration;
    use tokio::sync::RwLock;

    fn resources() -> SharedResources {
        Arc::new(RwLock::new(ResourceRegistry::new(DeployEnvironment::new(
            "123456789012",
            "ap-southeast-1",
        ))))
    }

    fn eks_graph() -> StackGraph {
        let mut graph = StackGraph::new();
        graph
            .register(
                "EksNetworkStack",
                StackKind::Network {
                    cidr: "192.168.0.0/16".into(),
                    vpc_name: "EksVpc".into(),
                },
                Vec::<String>::new(),
            )
            .unwrap();
        graph
            .register(
                "EksClusterStack",
                StackKind::Cluster {
                    cluster_name: "EksCluster".into(),
                },
                ["EksNetworkStack"],
            )
            .unwrap();
        graph
            .register(
                "EcrStack",
                StackKind::Registry {
                    repository: "flask-app".into(),
                },
                Vec::<String>::new(),
            )
            .unwrap();
        graph
            .register(
                "CodePipelineFlaskApp",
                StackKind::Pipeline {
                    application: "flask-app".into(),
                },
                ["EcrStack"],
            )
            .unwrap();
        graph
    }

    #[tokio::test]
    async fn test_provisions_whole_graph() {
        let shared = resources();
        let provisioner = Arc::new(LocalProvisioner::new());
        let runner = StackProvisioning::new(provisioner.clone(), shared.clone());
        let mut graph = eks_graph();

        let report = runner.run(&mut graph).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.provisioned.len(), 4);
        assert!(graph.is_complete());

        let started = provisioner.started();
        let position = |name: &str| started.iter().position(|s| s == name).unwrap();
        assert!(position("EksNetworkStack") < position("EksClusterStack"));
        assert!(position("EcrStack") < position("CodePipelineFlaskApp"));

        let resources = shared.read().await;
        assert!(resources.cluster("EksCluster").is_ok());
        assert_eq!(resources.registry("flask-app").unwrap().repository, "flask-app");
    }

    #[tokio::test]
    async fn test_independent_subtree_continues_after_failure() {
        let provisioner = Arc::new(LocalProvisioner::new());
        provisioner.fail_stack("EksNetworkStack", Error::Network("throttled".into()));
        let runner = StackProvisioning::new(provisioner, resources());
        let mut graph = eks_graph();

        let report = runner.run(&mut graph).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.first_failure().unwrap().0, "EksNetworkStack");
        assert_eq!(report.blocked, vec!["EksClusterStack"]);
        assert!(report.provisioned.contains(&"EcrStack".to_string()));
        assert!(report.provisioned.contains(&"CodePipelineFlaskApp".to_string()));
        assert_eq!(graph.status("EksNetworkStack").unwrap(), StackStatus::Failed);
        assert_eq!(graph.status("EksClusterStack").unwrap(), StackStatus::Pending);
    }

    /// Fails "A" at once; everything else takes a while.
    struct SlowExceptA;

    #[async_trait]
    impl StackProvisioner for SlowExceptA {
        fn name(&self) -> &'static str {
            "slow-except-a"
        }

        async fn provision(
            &self,
            node: &StackNode,
            _resources: &ResourceRegistry,
        ) -> Result<Vec<ProvisionedResource>> {
            if node.name == "A" {
                return Err(Error::Permission("denied".into()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(vec![ProvisionedResource {
                kind: ResourceKind::Registry,
                name: node.kind.resource_name().to_string(),
                id: node.name.clone(),
            }])
        }
    }

    fn registry_stack(repository: &str) -> StackKind {
        StackKind::Registry {
            repository: repository.into(),
        }
    }

    #[tokio::test]
    async fn test_fail_fast_stops_launching() {
        let mut graph = StackGraph::new();
        graph.register("A", registry_stack("a"), Vec::<String>::new()).unwrap();
        graph.register("C", registry_stack("c"), Vec::<String>::new()).unwrap();
        graph.register("B", registry_stack("b"), ["C"]).unwrap();

        let runner = StackProvisioning::new(Arc::new(SlowExceptA), resources()).with_fail_fast(true);
        let report = runner.run(&mut graph).await.unwrap();

        // C was already in flight and finishes; B is never launched.
        assert_eq!(report.provisioned, vec!["C"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.blocked, vec!["B"]);
    }

    #[tokio::test]
    async fn test_without_fail_fast_dependents_of_healthy_stacks_run() {
        let mut graph = StackGraph::new();
        graph.register("A", registry_stack("a"), Vec::<String>::new()).unwrap();
        graph.register("C", registry_stack("c"), Vec::<String>::new()).unwrap();
        graph.register("B", registry_stack("b"), ["C"]).unwrap();

        let runner = StackProvisioning::new(Arc::new(SlowExceptA), resources());
        let report = runner.run(&mut graph).await.unwrap();

        assert_eq!(report.provisioned, vec!["C", "B"]);
        assert!(report.blocked.is_empty());
    }

    #[tokio::test]
    async fn test_status_updates_published() {
        let runner = StackProvisioning::new(Arc::new(LocalProvisioner::new()), resources());
        let mut rx = runner.subscribe();
        let mut graph = eks_graph();

        runner.run(&mut graph).await.unwrap();

        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.complete);
        assert_eq!(snapshot.status("EksClusterStack"), Some(StackStatus::Provisioned));
        assert!(snapshot.settled(&["CodePipelineFlaskApp".to_string()]));
        assert!(snapshot.unmet(&["CodePipelineFlaskApp".to_string()]).is_empty());
    }

    #[test]
    fn test_snapshot_settles_on_failure() {
        let snapshot = StackSnapshot {
            statuses: BTreeMap::from([
                ("EcrStack".to_string(), StackStatus::Failed),
                ("EksNetworkStack".to_string(), StackStatus::Provisioning),
            ]),
            complete: false,
        };
        let required = vec!["EcrStack".to_string(), "EksNetworkStack".to_string()];
        assert!(snapshot.settled(&required));
        assert_eq!(snapshot.unmet(&required), required);
    }

    #[tokio::test]
    async fn test_unknown_prerequisite_rejected_before_launch() {
        let provisioner = Arc::new(LocalProvisioner::new());
        let runner = StackProvisioning::new(provisioner.clone(), resources());
        let mut graph = StackGraph::new();
        graph.register("EksClusterStack", registry_stack("x"), ["Missing"]).unwrap();

        assert!(matches!(runner.run(&mut graph).await, Err(Error::NotFound(_))));
        assert!(provisioner.started().is_empty());
    }
}
