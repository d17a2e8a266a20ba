//! Topology synthesis: what `deploy` would do, without doing it.

use anyhow::{Context, Result};
use shipyard_core::pipeline::StageSpec;
use std::path::Path;

use super::load_topology;

pub fn synth(path: &Path, json: bool) -> Result<()> {
    let topology = load_topology(path)?;
    let graph = topology.stack_graph().context("Invalid stack graph")?;
    let order = graph.provision_order()?;
    let pipelines = topology.pipelines().context("Invalid pipeline")?;

    if json {
        let stacks = order
            .iter()
            .map(|name| graph.node(name).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let document = serde_json::json!({
            "environment": topology.environment,
            "stacks": stacks,
            "imports": topology
                .imports
                .iter()
                .map(|(kind, name)| serde_json::json!({ "kind": kind, "name": name }))
                .collect::<Vec<_>>(),
            "pipelines": pipelines,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    println!(
        "Environment: account {} / region {}",
        topology.environment.account, topology.environment.region
    );

    println!("\nStacks (provisioning order):");
    for (idx, name) in order.iter().enumerate() {
        let node = graph.node(name)?;
        println!(
            "  {}. {} [{}: {}]",
            idx + 1,
            node.name,
            node.kind.resource_kind(),
            node.kind.resource_name()
        );
        if !node.prerequisites.is_empty() {
            println!("     needs: {}", node.prerequisites.join(", "));
        }
    }

    if !topology.imports.is_empty() {
        println!("\nImported resources:");
        for (kind, name) in &topology.imports {
            println!("  {} {}", kind, name);
        }
    }

    println!("\nPipelines:");
    for spec in &pipelines {
        println!(
            "  {} (app {}, registry {}, parameter {})",
            spec.name, spec.application, spec.registry, spec.parameter_key
        );
        for stage in &spec.stages {
            println!("    {}", describe_stage(stage));
        }
    }

    Ok(())
}

fn describe_stage(stage: &StageSpec) -> String {
    let input = stage
        .input
        .as_ref()
        .map(|decl| decl.to_string())
        .unwrap_or_else(|| "-".to_string());
    let output = stage
        .output
        .as_ref()
        .map(|decl| decl.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{} [{}] {} -> {}", stage.name, stage.kind(), input, output)
}
