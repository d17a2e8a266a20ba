//! Core domain types and traits for Shipyard.
//!
//! This crate contains:
//! - Resource identifiers, errors and the resource registry
//! - The stack dependency graph
//! - Pipeline and stage definitions, and the per-application builder
//! - Artifact channels passed between stages
//! - Build executions and the image tag protocol
//! - Collaborator traits (registry, parameter store, source, deployer, provisioner)

pub mod application;
pub mod artifact;
pub mod build;
pub mod deployer;
pub mod error;
pub mod id;
pub mod parameter;
pub mod pipeline;
pub mod registry;
pub mod resource;
pub mod source;
pub mod stack;

pub use error::{Error, Result};
pub use id::ResourceId;
