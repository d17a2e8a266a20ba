//! Topology configuration parsing.
//!
//! A topology file declares the deployment environment, the infrastructure
//! stacks with their prerequisites, resources imported by name, and the
//! applications that each get a build pipeline.

use crate::environment::resolve_environment;
use crate::{ConfigError, ConfigResult, VariableContext};
use kdl::{KdlDocument, KdlNode};
use shipyard_core::application::AppDescriptor;
use shipyard_core::deployer::DeployTarget;
use shipyard_core::pipeline::{
    BuildSettings, DEFAULT_DEPLOY_TIMEOUT, DeploySettings, EnvBinding, PipelineSpec, RetryPolicy,
};
use shipyard_core::registry::RegistryCoordinate;
use shipyard_core::resource::{DeployEnvironment, ResourceKind, ResourceRegistry};
use shipyard_core::source::SourceLocator;
use shipyard_core::stack::{StackGraph, StackKind};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// A declared infrastructure stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDecl {
    pub name: String,
    pub kind: StackKind,
    pub needs: Vec<String>,
}

/// A parsed topology file.
#[derive(Debug, Clone)]
pub struct Topology {
    pub environment: DeployEnvironment,
    pub stacks: Vec<StackDecl>,
    /// Resources that exist outside this topology.
    pub imports: Vec<(ResourceKind, String)>,
    pub applications: Vec<AppDescriptor>,
}

impl Topology {
    /// Build the stack graph: declared stacks first, then one pipeline stack
    /// per application, in declaration order.
    pub fn stack_graph(&self) -> ConfigResult<StackGraph> {
        let mut graph = StackGraph::new();
        for stack in &self.stacks {
            graph.register(stack.name.clone(), stack.kind.clone(), stack.needs.clone())?;
        }
        for app in &self.applications {
            graph.register(
                app.pipeline_name(),
                StackKind::Pipeline {
                    application: app.name.clone(),
                },
                app.requires.clone(),
            )?;
        }
        graph.provision_order()?;
        Ok(graph)
    }

    /// Resource registry seeded with every imported resource.
    pub fn resource_registry(&self) -> ConfigResult<ResourceRegistry> {
        let mut registry = ResourceRegistry::new(self.environment.clone());
        for (kind, name) in &self.imports {
            registry.import(*kind, name.clone())?;
        }
        Ok(registry)
    }

    /// Validated pipeline specs, one per application.
    pub fn pipelines(&self) -> ConfigResult<Vec<PipelineSpec>> {
        self.applications
            .iter()
            .map(|app| {
                let spec = PipelineSpec::for_application(app);
                spec.validate().map_err(|e| ConfigError::InvalidValue {
                    field: format!("application '{}'", app.name),
                    message: e.to_string(),
                })?;
                Ok(spec)
            })
            .collect()
    }

    /// Coordinate of a registry that is either imported or provisioned by a
    /// registry stack.
    pub fn registry_coordinate(&self, name: &str) -> ConfigResult<RegistryCoordinate> {
        let imported = self
            .imports
            .iter()
            .any(|(kind, n)| *kind == ResourceKind::Registry && n == name);
        let provisioned = self.stacks.iter().any(
            |s| matches!(&s.kind, StackKind::Registry { repository } if repository == name),
        );
        if !imported && !provisioned {
            return Err(ConfigError::InvalidReference(format!(
                "unknown registry '{}'",
                name
            )));
        }
        Ok(RegistryCoordinate {
            host: self.environment.registry_host(),
            repository: name.to_string(),
        })
    }

    pub fn application(&self, name: &str) -> Option<&AppDescriptor> {
        self.applications.iter().find(|a| a.name == name)
    }
}

/// Parse a topology using the process environment for fallbacks and `${env.*}`.
pub fn parse_topology(kdl: &str) -> ConfigResult<Topology> {
    let mut vars = VariableContext::new();
    vars.populate_env();
    parse_topology_with(kdl, vars)
}

/// Parse a topology against an explicit variable context.
pub fn parse_topology_with(kdl: &str, mut vars: VariableContext) -> ConfigResult<Topology> {
    let doc: KdlDocument = kdl.parse()?;

    // The environment comes first so every other value can interpolate it.
    let env_node = doc.nodes().iter().find(|n| n.name().value() == "environment");
    let account = env_node.and_then(|n| get_string_prop(n, "account"));
    let region = env_node.and_then(|n| get_string_prop(n, "region"));
    let environment = resolve_environment(
        account.map(|a| vars.interpolate(&a)),
        region.map(|r| vars.interpolate(&r)),
        &vars,
    )?;
    vars.account = environment.account.clone();
    vars.region = environment.region.clone();

    let mut stacks = Vec::new();
    let mut imports = Vec::new();
    let mut applications = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "environment" => {}
            "stack" => stacks.push(parse_stack(node, &vars)?),
            "resource" => imports.push(parse_import(node, &vars)?),
            "application" => applications.push(parse_application(node, &vars)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let mut topology = Topology {
        environment,
        stacks,
        imports,
        applications,
    };
    check_references(&topology)?;
    link_registry_stacks(&mut topology);

    debug!(
        stacks = topology.stacks.len(),
        imports = topology.imports.len(),
        applications = topology.applications.len(),
        "Parsed topology"
    );
    Ok(topology)
}

fn parse_stack(node: &KdlNode, vars: &VariableContext) -> ConfigResult<StackDecl> {
    let name = get_first_string_arg(node)
        .map(|n| vars.interpolate(&n))
        .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;
    let kind_name = get_string_prop(node, "kind")
        .ok_or_else(|| ConfigError::MissingField(format!("kind for stack '{}'", name)))?;
    let prop = |key: &str| -> ConfigResult<String> {
        get_string_prop(node, key)
            .map(|v| vars.interpolate(&v))
            .ok_or_else(|| ConfigError::MissingField(format!("{} for stack '{}'", key, name)))
    };

    let kind = match kind_name.as_str() {
        "network" => StackKind::Network {
            cidr: prop("cidr")?,
            vpc_name: prop("vpc")?,
        },
        "cluster" => StackKind::Cluster {
            cluster_name: prop("cluster")?,
        },
        "registry" => StackKind::Registry {
            repository: prop("repository")?,
        },
        other => {
            return Err(ConfigError::InvalidValue {
                field: format!("kind for stack '{}'", name),
                message: format!("unknown stack kind: {}", other),
            });
        }
    };

    Ok(StackDecl {
        needs: get_string_list_prop(node, "needs"),
        name,
        kind,
    })
}

fn parse_import(node: &KdlNode, vars: &VariableContext) -> ConfigResult<(ResourceKind, String)> {
    let args = get_all_string_args(node);
    let [kind, name] = args.as_slice() else {
        return Err(ConfigError::InvalidValue {
            field: "resource".to_string(),
            message: "expected: resource \"<kind>\" \"<name>\"".to_string(),
        });
    };
    let kind = kind
        .parse::<ResourceKind>()
        .map_err(|e| ConfigError::InvalidValue {
            field: "resource kind".to_string(),
            message: e.to_string(),
        })?;
    Ok((kind, vars.interpolate(name)))
}

fn parse_application(node: &KdlNode, vars: &VariableContext) -> ConfigResult<AppDescriptor> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("application name".to_string()))?;
    let mut vars = vars.clone();
    vars.app = Some(name.clone());

    let registry = get_string_prop(node, "registry")
        .map(|r| vars.interpolate(&r))
        .unwrap_or_else(|| name.clone());

    let mut source = None;
    let mut build = BuildSettings::default();
    let mut parameter_key = None;
    let mut deploy = None;
    let mut retry = RetryPolicy::default();
    let mut env = std::collections::BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "source" => source = Some(parse_source(child, &name, &vars)?),
                "parameter" => {
                    parameter_key = get_first_string_arg(child).map(|p| vars.interpolate(&p));
                }
                "buildspec" => {
                    build.buildspec = get_first_string_arg(child).map(|b| vars.interpolate(&b));
                }
                "context" => {
                    if let Some(context) = get_first_string_arg(child) {
                        build.context = vars.interpolate(&context);
                    }
                    if let Some(dockerfile) = get_string_prop(child, "dockerfile") {
                        build.dockerfile = vars.interpolate(&dockerfile);
                    }
                }
                "project" => {
                    build.project = get_first_string_arg(child).unwrap_or_default();
                }
                "compute" => {
                    let size = get_first_string_arg(child).unwrap_or_default();
                    build.compute = size.parse().map_err(|e: shipyard_core::Error| {
                        ConfigError::InvalidValue {
                            field: format!("compute for application '{}'", name),
                            message: e.to_string(),
                        }
                    })?;
                }
                "privileged" => {
                    build.privileged = get_first_bool_arg(child).ok_or_else(|| {
                        ConfigError::InvalidValue {
                            field: format!("privileged for application '{}'", name),
                            message: "expected a boolean".to_string(),
                        }
                    })?;
                }
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            let binding = if let Some(param) = get_string_prop(gc, "parameter") {
                                EnvBinding::Parameter(vars.interpolate(&param))
                            } else if let Some(value) = get_first_string_arg(gc) {
                                EnvBinding::Plaintext(vars.interpolate(&value))
                            } else {
                                return Err(ConfigError::MissingField(format!(
                                    "value for env '{}' in application '{}'",
                                    key, name
                                )));
                            };
                            env.insert(key, binding);
                        }
                    }
                }
                "retries" => {
                    let field = format!("retries for application '{}'", name);
                    retry.max_retries = get_first_int_arg(child)
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| ConfigError::InvalidValue {
                            field: field.clone(),
                            message: "expected a non-negative integer".to_string(),
                        })?;
                    if let Some(ms) = get_int_prop(child, "backoff-ms") {
                        retry.base_backoff = millis(ms, &field)?;
                    }
                    if let Some(ms) = get_int_prop(child, "max-backoff-ms") {
                        retry.max_backoff = millis(ms, &field)?;
                    }
                }
                "deploy" => deploy = Some(parse_deploy(child, &name, &vars)?),
                _ => {}
            }
        }
    }

    let source = source.ok_or_else(|| {
        ConfigError::MissingField(format!("source for application '{}'", name))
    })?;

    Ok(AppDescriptor {
        requires: get_string_list_prop(node, "needs"),
        name,
        registry,
        source,
        build,
        parameter_key,
        env,
        deploy,
        retry,
    })
}

fn millis(value: i128, field: &str) -> ConfigResult<Duration> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("invalid milliseconds: {}", value),
        })
}

fn parse_source(node: &KdlNode, app: &str, vars: &VariableContext) -> ConfigResult<SourceLocator> {
    let source_type = get_first_string_arg(node).unwrap_or_default();
    let prop = |key: &str| -> ConfigResult<String> {
        get_string_prop(node, key)
            .map(|v| vars.interpolate(&v))
            .ok_or_else(|| {
                ConfigError::MissingField(format!("source {} for application '{}'", key, app))
            })
    };
    let branch = get_string_prop(node, "branch")
        .map(|b| vars.interpolate(&b))
        .unwrap_or_else(|| "main".to_string());

    match source_type.as_str() {
        "connection" => Ok(SourceLocator::Connection {
            owner: prop("owner")?,
            repo: prop("repo")?,
            connection: prop("connection")?,
            branch,
        }),
        "codecommit" => Ok(SourceLocator::CodeCommit {
            repository: get_string_prop(node, "repository")
                .map(|r| vars.interpolate(&r))
                .unwrap_or_else(|| app.to_string()),
            branch,
        }),
        _ => Err(ConfigError::InvalidValue {
            field: format!("source type for application '{}'", app),
            message: format!("unknown source type: {}", source_type),
        }),
    }
}

fn parse_deploy(node: &KdlNode, app: &str, vars: &VariableContext) -> ConfigResult<DeploySettings> {
    let service = get_string_prop(node, "service")
        .map(|s| vars.interpolate(&s))
        .ok_or_else(|| {
            ConfigError::MissingField(format!("deploy service for application '{}'", app))
        })?;
    let timeout = match get_int_prop(node, "timeout-seconds") {
        Some(secs) => u64::try_from(secs)
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                field: format!("deploy timeout for application '{}'", app),
                message: format!("invalid seconds: {}", secs),
            })?,
        None => DEFAULT_DEPLOY_TIMEOUT,
    };

    Ok(DeploySettings {
        target: DeployTarget {
            service,
            cluster: get_string_prop(node, "cluster").map(|c| vars.interpolate(&c)),
        },
        timeout,
    })
}

/// Cross-node checks: unique names, known `needs`, resolvable registries.
fn check_references(topology: &Topology) -> ConfigResult<()> {
    let mut stack_names = HashSet::new();
    for stack in &topology.stacks {
        if !stack_names.insert(stack.name.clone()) {
            return Err(ConfigError::Duplicate(format!("stack '{}'", stack.name)));
        }
    }

    let mut app_names = HashSet::new();
    for app in &topology.applications {
        if !app_names.insert(app.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("application '{}'", app.name)));
        }
        if !stack_names.insert(app.pipeline_name()) {
            return Err(ConfigError::Duplicate(format!(
                "stack '{}' (pipeline of application '{}')",
                app.pipeline_name(),
                app.name
            )));
        }
    }

    let needs = topology
        .stacks
        .iter()
        .map(|s| (s.name.as_str(), &s.needs))
        .chain(topology.applications.iter().map(|a| (a.name.as_str(), &a.requires)));
    for (owner, needs) in needs {
        for need in needs {
            if !stack_names.contains(need) {
                return Err(ConfigError::InvalidReference(format!(
                    "'{}' needs unknown stack '{}'",
                    owner, need
                )));
            }
        }
    }

    let mut registries: HashSet<&str> = topology
        .imports
        .iter()
        .filter(|(kind, _)| *kind == ResourceKind::Registry)
        .map(|(_, name)| name.as_str())
        .collect();
    registries.extend(topology.stacks.iter().filter_map(|s| match &s.kind {
        StackKind::Registry { repository } => Some(repository.as_str()),
        _ => None,
    }));
    for app in &topology.applications {
        if !registries.contains(app.registry.as_str()) {
            return Err(ConfigError::InvalidReference(format!(
                "application '{}' targets unknown registry '{}'",
                app.name, app.registry
            )));
        }
    }

    Ok(())
}

/// A pipeline pushing to a registry that a stack provisions must wait for
/// that stack.
fn link_registry_stacks(topology: &mut Topology) {
    for app in &mut topology.applications {
        let provider = topology.stacks.iter().find(|s| {
            matches!(&s.kind, StackKind::Registry { repository } if *repository == app.registry)
        });
        if let Some(stack) = provider {
            if !app.requires.contains(&stack.name) {
                app.requires.push(stack.name.clone());
            }
        }
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    let value = node.entries().iter().find(|e| e.name().is_none())?.value();
    value.as_bool().or_else(|| match value.as_string()? {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    })
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated attributes like needs="a" needs="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: needs "a" "b"
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VariableContextBuilder;
    use shipyard_core::stack::StackStatus;

    fn vars() -> VariableContext {
        VariableContextBuilder::new()
            .with_env("CDK_DEFAULT_ACCOUNT", "123456789012")
            .with_env("CDK_DEFAULT_REGION", "ap-southeast-1")
            .with_env("REPO_OWNER", "entest-hai")
            .build()
    }

    const EKS: &str = r#"
        stack "EksNetworkStack" kind="network" cidr="192.168.0.0/16" vpc="EksVpc"
        stack "EksClusterLevel1Stack" kind="cluster" cluster="EksClusterLevel1" needs="EksNetworkStack"
        stack "EcrStack" kind="registry" repository="flask-app"

        application "flask-app" needs="EcrStack" {
            source "connection" owner="${env.REPO_OWNER}" repo="flask-polly-app" branch="main" connection="arn:aws:codestar-connections:${region}:${account}:connection/649dd950"
            parameter "FlaskApp"
            context "./app/" dockerfile="./app/Dockerfile"
            env {
                DOCKERHUB_USERNAME parameter="DOCKERHUB_USERNAME"
                TAG "xxx"
            }
        }
    "#;

    #[test]
    fn test_parse_eks_topology() {
        let topology = parse_topology_with(EKS, vars()).unwrap();
        assert_eq!(topology.environment.account, "123456789012");
        assert_eq!(topology.stacks.len(), 3);
        assert_eq!(topology.stacks[1].needs, vec!["EksNetworkStack"]);

        let app = topology.application("flask-app").unwrap();
        assert_eq!(app.registry, "flask-app");
        assert_eq!(app.requires, vec!["EcrStack"]);
        assert_eq!(app.build.context, "./app/");
        assert_eq!(app.build.dockerfile, "./app/Dockerfile");
        assert_eq!(app.parameter_key(), "FlaskApp");
        assert_eq!(
            app.env.get("DOCKERHUB_USERNAME"),
            Some(&EnvBinding::Parameter("DOCKERHUB_USERNAME".into()))
        );
        assert_eq!(app.env.get("TAG"), Some(&EnvBinding::Plaintext("xxx".into())));
        match &app.source {
            SourceLocator::Connection { owner, connection, .. } => {
                assert_eq!(owner, "entest-hai");
                assert_eq!(
                    connection,
                    "arn:aws:codestar-connections:ap-southeast-1:123456789012:connection/649dd950"
                );
            }
            other => panic!("expected connection source, got {:?}", other),
        }
        assert!(app.deploy.is_none());
    }

    #[test]
    fn test_stack_graph_includes_pipeline_stacks() {
        let topology = parse_topology_with(EKS, vars()).unwrap();
        let graph = topology.stack_graph().unwrap();
        assert_eq!(
            graph.provision_order().unwrap(),
            vec![
                "EksNetworkStack",
                "EksClusterLevel1Stack",
                "EcrStack",
                "CodePipelineFlaskApp"
            ]
        );
        assert_eq!(
            graph.status("CodePipelineFlaskApp").unwrap(),
            StackStatus::Pending
        );
    }

    #[test]
    fn test_pipelines_validate() {
        let topology = parse_topology_with(EKS, vars()).unwrap();
        let pipelines = topology.pipelines().unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].name, "CodePipelineFlaskApp");
        assert_eq!(pipelines[0].stages.len(), 2);
    }

    #[test]
    fn test_codecommit_apps_with_imported_registries() {
        let kdl = r#"
            environment account="111122223333" region="us-east-1"
            resource "registry" "chat-app"
            resource "registry" "blog-app"

            application "chat-app" registry="chat-app" {
                source "codecommit" repository="chat-app"
                buildspec "buildspec/build_spec_${app}.yaml"
                retries 2 backoff-ms=250
                deploy service="chat-service" timeout-seconds=120
            }
            application "blog-app" registry="blog-app" {
                source "codecommit"
            }
        "#;
        let topology = parse_topology_with(kdl, VariableContext::new()).unwrap();
        assert_eq!(topology.environment.region, "us-east-1");
        assert_eq!(topology.imports.len(), 2);

        let chat = topology.application("chat-app").unwrap();
        assert_eq!(chat.build.buildspec.as_deref(), Some("buildspec/build_spec_chat-app.yaml"));
        assert_eq!(chat.retry.max_retries, 2);
        assert_eq!(chat.retry.base_backoff, Duration::from_millis(250));
        let deploy = chat.deploy.as_ref().unwrap();
        assert_eq!(deploy.target.service, "chat-service");
        assert_eq!(deploy.timeout, Duration::from_secs(120));

        let blog = topology.application("blog-app").unwrap();
        assert_eq!(
            blog.source,
            SourceLocator::CodeCommit {
                repository: "blog-app".into(),
                branch: "main".into()
            }
        );

        let registry = topology.resource_registry().unwrap();
        assert_eq!(registry.registry("blog-app").unwrap().repository, "blog-app");
        assert_eq!(
            topology.registry_coordinate("chat-app").unwrap().host,
            "111122223333.dkr.ecr.us-east-1.amazonaws.com"
        );
        assert!(topology.registry_coordinate("nowhere").is_err());
    }

    #[test]
    fn test_registry_stack_becomes_prerequisite() {
        let kdl = r#"
            stack "EcrStack" kind="registry" repository="flask-app"
            application "flask-app" {
                source "codecommit"
            }
        "#;
        let topology = parse_topology_with(kdl, vars()).unwrap();
        assert_eq!(topology.applications[0].requires, vec!["EcrStack"]);
        let graph = topology.stack_graph().unwrap();
        assert_eq!(
            graph.node("CodePipelineFlaskApp").unwrap().prerequisites,
            vec!["EcrStack"]
        );
    }

    #[test]
    fn test_unknown_needs_rejected() {
        let kdl = r#"
            stack "EksClusterStack" kind="cluster" cluster="eks" needs="Missing"
        "#;
        assert!(matches!(
            parse_topology_with(kdl, vars()),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_by_graph() {
        let kdl = r#"
            stack "A" kind="registry" repository="a" needs="B"
            stack "B" kind="registry" repository="b" needs="A"
        "#;
        let topology = parse_topology_with(kdl, vars()).unwrap();
        assert!(matches!(
            topology.stack_graph(),
            Err(ConfigError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_duplicate_stack_rejected() {
        let kdl = r#"
            stack "EcrStack" kind="registry" repository="a"
            stack "EcrStack" kind="registry" repository="b"
        "#;
        assert!(matches!(
            parse_topology_with(kdl, vars()),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_unknown_registry_rejected() {
        let kdl = r#"
            application "chat-app" registry="nowhere" {
                source "codecommit"
            }
        "#;
        assert!(matches!(
            parse_topology_with(kdl, vars()),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_missing_source_rejected() {
        let kdl = r#"
            resource "registry" "chat-app"
            application "chat-app" {
                parameter "ChatApp"
            }
        "#;
        assert!(matches!(
            parse_topology_with(kdl, vars()),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_unknown_stack_kind_rejected() {
        let kdl = r#"stack "Bucket" kind="bucket""#;
        assert!(matches!(
            parse_topology_with(kdl, vars()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_environment_rejected() {
        let kdl = r#"stack "EcrStack" kind="registry" repository="a""#;
        assert!(matches!(
            parse_topology_with(kdl, VariableContext::new()),
            Err(ConfigError::MissingField(_))
        ));
    }
}
