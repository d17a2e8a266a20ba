//! Artifact channels: single-producer conduits carrying stage output to later
//! stages.
//!
//! A channel accepts exactly one [`Artifact`]. Any number of subscribers may
//! read it; reading before publish is either an immediate
//! [`Error::NotReady`] ([`ArtifactSubscription::get`]) or a suspension point
//! ([`ArtifactSubscription::wait`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::build::BuildExecution;
use crate::source::SourceRevision;
use crate::{Error, ResourceId, Result};

/// What an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A resolved source checkout.
    Source,
    /// A pushed image and the build that produced it.
    Image,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Source => write!(f, "source"),
            ArtifactKind::Image => write!(f, "image"),
        }
    }
}

/// Declared artifact type on a stage boundary. Two declarations chain only
/// if both name and kind agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactDecl {
    pub name: String,
    pub kind: ArtifactKind,
}

impl ArtifactDecl {
    pub fn source(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArtifactKind::Source,
        }
    }

    pub fn image(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArtifactKind::Image,
        }
    }
}

impl std::fmt::Display for ArtifactDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Artifact contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactPayload {
    Source(SourceRevision),
    Image(BuildExecution),
}

impl ArtifactPayload {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactPayload::Source(_) => ArtifactKind::Source,
            ArtifactPayload::Image(_) => ArtifactKind::Image,
        }
    }
}

/// An immutable bundle produced by one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ResourceId,
    pub name: String,
    /// Name of the producing stage.
    pub producer: String,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the serialized payload.
    pub digest: String,
    pub payload: ArtifactPayload,
    pub metadata: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        producer: impl Into<String>,
        payload: ArtifactPayload,
    ) -> Result<Self> {
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| Error::Internal(format!("failed to serialize artifact: {}", e)))?;
        let digest = hex::encode(Sha256::digest(&bytes));

        Ok(Self {
            id: ResourceId::new(),
            name: name.into(),
            producer: producer.into(),
            created_at: Utc::now(),
            digest,
            payload,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ArtifactKind {
        self.payload.kind()
    }

    pub fn decl(&self) -> ArtifactDecl {
        ArtifactDecl {
            name: self.name.clone(),
            kind: self.kind(),
        }
    }

    pub fn source_revision(&self) -> Option<&SourceRevision> {
        match &self.payload {
            ArtifactPayload::Source(revision) => Some(revision),
            _ => None,
        }
    }

    pub fn build(&self) -> Option<&BuildExecution> {
        match &self.payload {
            ArtifactPayload::Image(execution) => Some(execution),
            _ => None,
        }
    }
}

type Slot = Option<Arc<Artifact>>;

/// A single-producer, multi-consumer conduit for one declared artifact.
#[derive(Debug)]
pub struct ArtifactChannel {
    decl: ArtifactDecl,
    tx: watch::Sender<Slot>,
}

impl ArtifactChannel {
    pub fn new(decl: ArtifactDecl) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { decl, tx }
    }

    pub fn decl(&self) -> &ArtifactDecl {
        &self.decl
    }

    /// Publish the channel's artifact. Only the first call succeeds; the
    /// published value never changes afterwards.
    pub fn publish(&self, artifact: Artifact) -> Result<Arc<Artifact>> {
        let found = artifact.decl();
        if found != self.decl {
            return Err(Error::ArtifactTypeMismatch {
                stage: artifact.producer.clone(),
                expected: self.decl.to_string(),
                found: found.to_string(),
            });
        }

        let artifact = Arc::new(artifact);
        let published = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(artifact.clone());
            true
        });

        if !published {
            return Err(Error::AlreadyPublished(self.decl.name.clone()));
        }

        debug!(
            artifact = %self.decl.name,
            producer = %artifact.producer,
            digest = %artifact.digest,
            "Artifact published"
        );
        Ok(artifact)
    }

    pub fn is_published(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Read-only handle for a downstream stage.
    pub fn subscribe(&self) -> ArtifactSubscription {
        ArtifactSubscription {
            name: self.decl.name.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of an [`ArtifactChannel`].
#[derive(Debug, Clone)]
pub struct ArtifactSubscription {
    name: String,
    rx: watch::Receiver<Slot>,
}

impl ArtifactSubscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current artifact, or [`Error::NotReady`] if nothing is published yet.
    pub fn get(&self) -> Result<Arc<Artifact>> {
        self.rx
            .borrow()
            .clone()
            .ok_or_else(|| Error::NotReady(self.name.clone()))
    }

    /// Suspend until the artifact is published.
    ///
    /// Fails with [`Error::NotReady`] if the channel is dropped unpublished.
    pub async fn wait(&mut self) -> Result<Arc<Artifact>> {
        let slot = self
            .rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| Error::NotReady(self.name.clone()))?;
        slot.clone().ok_or_else(|| Error::NotReady(self.name.clone()))
    }

    /// Like [`wait`](Self::wait) but gives up with [`Error::Timeout`].
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Arc<Artifact>> {
        let name = self.name.clone();
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Timeout(format!("waiting for artifact '{}'", name)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision(commit: &str) -> ArtifactPayload {
        ArtifactPayload::Source(SourceRevision {
            commit: commit.to_string(),
            branch: "main".to_string(),
            repository: "flask-app".to_string(),
        })
    }

    fn source_artifact(commit: &str) -> Artifact {
        Artifact::new("SourceOutput", "SourceCode", revision(commit)).unwrap()
    }

    #[test]
    fn test_read_before_publish_is_not_ready() {
        let channel = ArtifactChannel::new(ArtifactDecl::source("SourceOutput"));
        let sub = channel.subscribe();
        assert_eq!(sub.get().unwrap_err(), Error::NotReady("SourceOutput".into()));
        assert!(!channel.is_published());
    }

    #[test]
    fn test_second_publish_fails_and_first_value_survives() {
        let channel = ArtifactChannel::new(ArtifactDecl::source("SourceOutput"));
        let sub = channel.subscribe();

        let first = channel.publish(source_artifact("r1")).unwrap();
        let err = channel.publish(source_artifact("r2")).unwrap_err();
        assert_eq!(err, Error::AlreadyPublished("SourceOutput".into()));

        let read = sub.get().unwrap();
        assert_eq!(read.id, first.id);
        assert_eq!(read.source_revision().unwrap().commit, "r1");
    }

    #[test]
    fn test_many_subscribers_see_same_artifact() {
        let channel = ArtifactChannel::new(ArtifactDecl::source("SourceOutput"));
        let subs: Vec<_> = (0..3).map(|_| channel.subscribe()).collect();
        channel.publish(source_artifact("r1")).unwrap();
        let late = channel.subscribe();

        for sub in subs.iter().chain(std::iter::once(&late)) {
            assert_eq!(sub.get().unwrap().source_revision().unwrap().commit, "r1");
        }
    }

    #[test]
    fn test_publish_rejects_wrong_declaration() {
        let channel = ArtifactChannel::new(ArtifactDecl::image("BuildOutput"));
        let err = channel.publish(source_artifact("r1")).unwrap_err();
        assert!(matches!(err, Error::ArtifactTypeMismatch { .. }));
        assert!(!channel.is_published());
    }

    #[test]
    fn test_digest_is_stable_for_equal_payloads() {
        let a = source_artifact("abc123");
        let b = source_artifact("abc123");
        let c = source_artifact("def456");
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert_eq!(a.digest.len(), 64);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_publish() {
        let channel = Arc::new(ArtifactChannel::new(ArtifactDecl::source("SourceOutput")));
        let mut sub = channel.subscribe();

        let waiter = tokio::spawn(async move { sub.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        channel.publish(source_artifact("r7")).unwrap();
        let artifact = waiter.await.unwrap().unwrap();
        assert_eq!(artifact.source_revision().unwrap().commit, "r7");
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let channel = ArtifactChannel::new(ArtifactDecl::source("SourceOutput"));
        let mut sub = channel.subscribe();
        let err = sub.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wait_on_dropped_channel_is_not_ready() {
        let channel = ArtifactChannel::new(ArtifactDecl::source("SourceOutput"));
        let mut sub = channel.subscribe();
        drop(channel);
        assert_eq!(
            sub.wait().await.unwrap_err(),
            Error::NotReady("SourceOutput".into())
        );
    }
}
