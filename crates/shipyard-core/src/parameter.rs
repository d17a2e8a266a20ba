//! Parameter store abstraction.
//!
//! A durable key-value service shared between a build and any deploy process
//! that runs independently of it. Writes are last-writer-wins.

use async_trait::async_trait;

use crate::registry::{ImageReference, RegistryCoordinate};
use crate::Result;

/// Trait for parameter store backends.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Write a value. With `overwrite == false` an existing key is a
    /// [`crate::Error::Conflict`]. Denied writes are [`crate::Error::Permission`].
    async fn put(&self, key: &str, value: &str, overwrite: bool) -> Result<()>;

    /// Read a value, or [`crate::Error::NotFound`].
    async fn get(&self, key: &str) -> Result<String>;
}

/// Resolve the most recently published image for a parameter key.
///
/// This is the lookup a decoupled deploy process performs; it never observes
/// the build that wrote the key.
pub async fn latest_image(
    store: &dyn ParameterStore,
    key: &str,
    coordinate: &RegistryCoordinate,
) -> Result<ImageReference> {
    let tag = store.get(key).await?;
    Ok(coordinate.image(tag))
}
