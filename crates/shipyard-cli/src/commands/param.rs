//! Parameter store lookups, as a decoupled deploy process would perform them.

use anyhow::{Context, Result};
use shipyard_core::parameter::{ParameterStore, latest_image};
use shipyard_executor::FileParameterStore;
use std::path::Path;

use super::load_topology;

pub async fn get(
    topology_path: &Path,
    param_file: &Path,
    key: &str,
    registry: Option<&str>,
) -> Result<()> {
    let store = FileParameterStore::new(param_file);

    match registry {
        Some(registry) => {
            let topology = load_topology(topology_path)?;
            let coordinate = topology.registry_coordinate(registry)?;
            let image = latest_image(&store, key, &coordinate)
                .await
                .with_context(|| format!("No image published under '{}'", key))?;
            println!("{}", image);
        }
        None => {
            let value = store
                .get(key)
                .await
                .with_context(|| format!("Failed to read parameter '{}'", key))?;
            println!("{}", value);
        }
    }

    Ok(())
}
