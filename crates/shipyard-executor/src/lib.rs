//! Collaborator backends for Shipyard pipelines.
//!
//! Provides implementations of the core collaborator traits:
//! - In-memory parameter store and image registry (tests, dry runs)
//! - JSON file parameter store (local deploys)
//! - Git checkout source provider
//! - Local stack provisioner and recording deployer

pub mod file_store;
pub mod git;
pub mod local;
pub mod memory;

pub use file_store::FileParameterStore;
pub use git::GitSource;
pub use local::{LocalProvisioner, RecordingDeployer};
pub use memory::{InMemoryParameterStore, InMemoryRegistry, RegistryCall, RegistryStep};

pub use shipyard_core::deployer::Deployer;
pub use shipyard_core::parameter::ParameterStore;
pub use shipyard_core::registry::ImageRegistry;
pub use shipyard_core::source::SourceProvider;
pub use shipyard_core::stack::StackProvisioner;

/// Content digest in registry notation.
pub(crate) fn digest_of(parts: &[&str]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
