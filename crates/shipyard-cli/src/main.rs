//! Shipyard CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Provision deployment stacks and run image pipelines", long_about = None)]
struct Cli {
    /// Path to the topology file
    #[arg(
        long,
        short = 'f',
        env = "SHIPYARD_TOPOLOGY",
        default_value = "shipyard.kdl",
        global = true
    )]
    topology: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the provisioning order and derived pipelines
    Synth {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Validate the topology without provisioning anything
    Validate,
    /// Provision every stack and run the application pipelines
    Deploy {
        /// Build this revision instead of the checkout's HEAD
        #[arg(long)]
        revision: Option<String>,
        /// Source checkout to resolve revisions from
        #[arg(long, default_value = ".")]
        checkout: PathBuf,
        /// Parameter store file
        #[arg(long, env = "SHIPYARD_PARAM_FILE", default_value = ".shipyard/parameters.json")]
        param_file: PathBuf,
        /// Stop launching stacks after the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Only run these applications' pipelines
        #[arg(long = "app")]
        apps: Vec<String>,
        /// Seconds a pipeline waits for its required stacks
        #[arg(long, default_value = "3600")]
        gate_timeout: u64,
    },
    /// Read the parameter store
    Param {
        #[command(subcommand)]
        command: ParamCommands,
    },
}

#[derive(Subcommand)]
enum ParamCommands {
    /// Print the value stored under a key
    Get {
        /// Parameter key (e.g., "FlaskApp")
        key: String,
        /// Print the full image reference in this registry
        #[arg(long)]
        registry: Option<String>,
        /// Parameter store file
        #[arg(long, env = "SHIPYARD_PARAM_FILE", default_value = ".shipyard/parameters.json")]
        param_file: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Synth { json } => {
            commands::synth::synth(&cli.topology, json)?;
        }
        Commands::Validate => {
            commands::validate(&cli.topology)?;
        }
        Commands::Deploy {
            revision,
            checkout,
            param_file,
            fail_fast,
            apps,
            gate_timeout,
        } => {
            let options = commands::deploy::DeployOptions {
                revision,
                checkout,
                param_file,
                fail_fast,
                apps,
                gate_timeout: std::time::Duration::from_secs(gate_timeout),
            };
            commands::deploy::deploy(&cli.topology, options).await?;
        }
        Commands::Param { command } => match command {
            ParamCommands::Get {
                key,
                registry,
                param_file,
            } => {
                commands::param::get(&cli.topology, &param_file, &key, registry.as_deref()).await?;
            }
        },
    }

    Ok(())
}
