//! In-memory collaborator backends.
//!
//! Both backends record every call so callers can assert on ordering, and
//! accept injected failures for exercising retry and failure paths.

use async_trait::async_trait;
use shipyard_core::parameter::ParameterStore;
use shipyard_core::registry::{
    BuiltImage, ImageBuildRequest, ImageReference, ImageRegistry, PushReceipt, RegistryCoordinate,
};
use shipyard_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::digest_of;

/// Parameter store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    values: Mutex<HashMap<String, String>>,
    /// Every successful write, in order.
    history: Mutex<Vec<(String, String)>>,
    deny_writes: AtomicBool,
}

impl InMemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without recording it as a write.
    pub fn with_value(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.into(), value.into());
        }
        self
    }

    /// Reject all subsequent writes with a permission error.
    pub fn deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    pub fn history(&self) -> Vec<(String, String)> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn put(&self, key: &str, value: &str, overwrite: bool) -> Result<()> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(Error::Permission(format!("write to parameter '{}' denied", key)));
        }

        let mut values = self
            .values
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?;
        if !overwrite && values.contains_key(key) {
            return Err(Error::Conflict(format!("parameter '{}' already exists", key)));
        }
        // History is appended under the values lock so its order matches
        // the order in which values were replaced.
        values.insert(key.to_string(), value.to_string());
        self.history
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .push((key.to_string(), value.to_string()));
        drop(values);
        debug!(key = %key, value = %value, "Parameter written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.value(key)
            .ok_or_else(|| Error::NotFound(format!("parameter '{}'", key)))
    }
}

/// A registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryStep {
    Authenticate,
    Build,
    Tag,
    Push,
}

/// A recorded registry call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    /// Registry host authenticated against.
    Authenticate(String),
    /// Local image name built, with the resolved build environment.
    Build {
        local_name: String,
        env: Vec<(String, String)>,
    },
    /// Remote reference applied.
    Tag(String),
    /// Remote reference pushed.
    Push(String),
}

impl RegistryCall {
    pub fn step(&self) -> RegistryStep {
        match self {
            RegistryCall::Authenticate(_) => RegistryStep::Authenticate,
            RegistryCall::Build { .. } => RegistryStep::Build,
            RegistryCall::Tag(_) => RegistryStep::Tag,
            RegistryCall::Push(_) => RegistryStep::Push,
        }
    }
}

/// Image registry that builds nothing and remembers everything.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    calls: Mutex<Vec<RegistryCall>>,
    failures: Mutex<HashMap<RegistryStep, VecDeque<Error>>>,
    build_delay: Option<Duration>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every build take this long.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Fail the next call of `step` with `error`. Queued failures are consumed
    /// in order, one per call.
    pub fn fail_next(&self, step: RegistryStep, error: Error) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.entry(step).or_default().push_back(error);
        }
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// References successfully pushed.
    pub fn pushed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RegistryCall::Push(reference) => Some(reference),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RegistryCall) -> Result<()> {
        let step = call.step();
        let injected = self
            .failures
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .get_mut(&step)
            .and_then(|queue| queue.pop_front());
        if let Some(error) = injected {
            debug!(step = ?step, error = %error, "Injected registry failure");
            return Err(error);
        }
        self.calls
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .push(call);
        Ok(())
    }
}

#[async_trait]
impl ImageRegistry for InMemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn authenticate(&self, target: &RegistryCoordinate) -> Result<()> {
        self.record(RegistryCall::Authenticate(target.host.clone()))
    }

    async fn build(&self, request: &ImageBuildRequest) -> Result<BuiltImage> {
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(RegistryCall::Build {
            local_name: request.local_name.clone(),
            env: request
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })?;
        Ok(BuiltImage {
            local_name: request.local_name.clone(),
            digest: digest_of(&[&request.local_name, &request.revision]),
        })
    }

    async fn tag(&self, _image: &BuiltImage, reference: &ImageReference) -> Result<()> {
        self.record(RegistryCall::Tag(reference.to_string()))
    }

    async fn push(&self, image: &BuiltImage, reference: &ImageReference) -> Result<PushReceipt> {
        self.record(RegistryCall::Push(reference.to_string()))?;
        Ok(PushReceipt {
            reference: reference.clone(),
            digest: image.digest.clone(),
        })
    }
}
