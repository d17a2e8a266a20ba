//! KDL configuration for Shipyard.
//!
//! This crate handles:
//! - Topology definitions (shipyard.kdl): stacks, imported resources, applications
//! - Account/region resolution from the environment
//! - Variable interpolation

pub mod environment;
pub mod error;
pub mod topology;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use topology::{StackDecl, Topology, parse_topology, parse_topology_with};
pub use variables::{VariableContext, VariableContextBuilder};
