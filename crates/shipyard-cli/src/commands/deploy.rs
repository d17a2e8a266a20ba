//! Provision the stack graph and run application pipelines locally.

use anyhow::{Context, Result, bail};
use shipyard_core::pipeline::PipelineStatus;
use shipyard_core::source::SourceProvider;
use shipyard_executor::{
    FileParameterStore, GitSource, InMemoryRegistry, LocalProvisioner, RecordingDeployer,
};
use shipyard_scheduler::{
    PipelineBackends, PipelineEvent, PipelineOrchestrator, ProvisionReport, SharedResources,
    StackProvisioning, StageState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use super::load_topology;

pub struct DeployOptions {
    pub revision: Option<String>,
    pub checkout: PathBuf,
    pub param_file: PathBuf,
    pub fail_fast: bool,
    pub apps: Vec<String>,
    pub gate_timeout: Duration,
}

pub async fn deploy(topology_path: &Path, options: DeployOptions) -> Result<()> {
    let topology = load_topology(topology_path)?;
    let mut graph = topology.stack_graph().context("Invalid stack graph")?;
    let pipelines: Vec<_> = topology
        .pipelines()
        .context("Invalid pipeline")?
        .into_iter()
        .filter(|p| options.apps.is_empty() || options.apps.contains(&p.application))
        .collect();
    for app in &options.apps {
        if topology.application(app).is_none() {
            bail!("Unknown application: {}", app);
        }
    }

    info!(
        stacks = graph.len(),
        pipelines = pipelines.len(),
        environment = %topology.environment.account,
        "Starting deployment"
    );

    let resources: SharedResources = Arc::new(RwLock::new(topology.resource_registry()?));
    let provisioning = StackProvisioning::new(Arc::new(LocalProvisioner::new()), resources.clone())
        .with_fail_fast(options.fail_fast);

    let source: Arc<dyn SourceProvider> = match options.revision {
        Some(revision) => Arc::new(GitSource::pinned(revision)),
        None => Arc::new(GitSource::new(options.checkout)),
    };
    if let Some(dir) = options.param_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let backends = PipelineBackends::new(
        source,
        Arc::new(InMemoryRegistry::new()),
        Arc::new(FileParameterStore::new(&options.param_file)),
        resources,
    )
    .with_deployer(Arc::new(RecordingDeployer::new()));
    let orchestrator = PipelineOrchestrator::new(backends)
        .with_stack_gate(provisioning.subscribe(), options.gate_timeout);

    // Start pipelines first; each holds until the stacks it needs are ready.
    let mut runs = Vec::new();
    for spec in &pipelines {
        let run = orchestrator
            .execute(spec)
            .with_context(|| format!("Failed to start pipeline {}", spec.name))?;
        runs.push((spec.name.clone(), run));
    }

    println!("--- Provisioning {} stacks ---\n", graph.len());
    let report = provisioning.run(&mut graph).await?;
    print_report(&report);

    let mut first_failure: Option<String> = report
        .first_failure()
        .map(|(stack, message)| format!("stack '{}' failed: {}", stack, message));

    for (name, mut run) in runs {
        println!("\n--- Pipeline {} ---\n", name);
        while let Some(event) = run.events.recv().await {
            print_event(&event);
        }
        let result = run
            .handle
            .await
            .context("Pipeline execution task failed")?;

        println!("\n  Stage summary:");
        for stage in pipelines
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.stages.as_slice())
            .unwrap_or_default()
        {
            let state = match result.stage_states.get(&stage.name) {
                Some(StageState::Succeeded) => "✓ succeeded".to_string(),
                Some(StageState::Failed { message }) => format!("✗ failed: {}", message),
                Some(StageState::Skipped { reason }) => format!("⊘ skipped: {}", reason),
                Some(StageState::Running { .. }) => "▶ running".to_string(),
                Some(StageState::Pending) | None => "○ pending".to_string(),
            };
            println!("    {} - {}", stage.name, state);
        }

        if let PipelineStatus::Failed { stage, message } = &result.status {
            first_failure.get_or_insert_with(|| {
                format!("pipeline '{}' failed at stage '{}': {}", name, stage, message)
            });
        } else if let Some(image) = result.image() {
            println!("\n✓ {} published {}", name, image);
        }
    }

    if let Some(failure) = first_failure {
        bail!(failure);
    }
    println!("\n✓ Deployment complete");
    Ok(())
}

fn print_report(report: &ProvisionReport) {
    for stack in &report.provisioned {
        println!("✓ Stack '{}' provisioned", stack);
    }
    for (stack, message) in &report.failed {
        println!("✗ Stack '{}' failed: {}", stack, message);
    }
    for stack in &report.blocked {
        println!("⊘ Stack '{}' blocked", stack);
    }
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage, attempt } => {
            if *attempt > 1 {
                println!("▶ Stage '{}' started (attempt {})", stage, attempt);
            } else {
                println!("▶ Stage '{}' started", stage);
            }
        }
        PipelineEvent::StageRetrying {
            stage,
            delay,
            error,
            ..
        } => {
            println!("↻ Stage '{}' retrying in {:?}: {}", stage, delay, error);
        }
        PipelineEvent::ImagePushed { image, .. } => {
            println!("  pushed {}", image);
        }
        PipelineEvent::ParameterWritten { key, value } => {
            println!("  parameter {} = {}", key, value);
        }
        PipelineEvent::StageCompleted { stage, success } => {
            if *success {
                println!("✓ Stage '{}' completed successfully", stage);
            } else {
                println!("✗ Stage '{}' failed", stage);
            }
        }
        PipelineEvent::PipelineCompleted { status } => match status {
            PipelineStatus::Succeeded => println!("--- Pipeline completed successfully ---"),
            PipelineStatus::Cancelled => println!("--- Pipeline cancelled ---"),
            _ => println!("--- Pipeline failed ---"),
        },
    }
}
