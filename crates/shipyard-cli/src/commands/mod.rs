//! CLI command implementations.

pub mod deploy;
pub mod param;
pub mod synth;

use anyhow::{Context, Result};
use shipyard_config::Topology;
use std::path::Path;

/// Read and parse a topology file.
pub fn load_topology(path: &Path) -> Result<Topology> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read topology file: {}", path.display()))?;
    shipyard_config::parse_topology(&content)
        .with_context(|| format!("Failed to parse topology: {}", path.display()))
}

pub fn validate(path: &Path) -> Result<()> {
    let topology = load_topology(path)?;
    let graph = topology
        .stack_graph()
        .context("Invalid stack graph")?;
    let pipelines = topology.pipelines().context("Invalid pipeline")?;
    println!(
        "✓ Topology is valid: {} stacks, {} pipelines",
        graph.len(),
        pipelines.len()
    );
    Ok(())
}
