//! Build executions and the image tag protocol.
//!
//! An image tag is `{source_revision}-{tag_suffix}`, where the suffix is the
//! build start time in whole seconds. Two builds of the same revision within
//! the same second produce the same tag; that collision is tolerated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::registry::{ImageReference, PushReceipt, RegistryCoordinate};
use crate::{Error, ResourceId, Result};

const MAX_TAG_LEN: usize = 128;

/// Source of build start times.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never goes backwards at second granularity.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let secs = now.timestamp();
        let prev = self.last.fetch_max(secs, Ordering::SeqCst);
        if prev > secs {
            DateTime::from_timestamp(prev, 0).unwrap_or(now)
        } else {
            now
        }
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Build-time component of an image tag: seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagSuffix(i64);

impl TagSuffix {
    pub fn from_time(at: DateTime<Utc>) -> Self {
        Self(at.timestamp())
    }

    pub fn seconds(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for TagSuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compose an image tag, rejecting revisions a registry would refuse.
pub fn image_tag(source_revision: &str, suffix: TagSuffix) -> Result<String> {
    if source_revision.is_empty() {
        return Err(Error::InvalidInput("empty source revision".to_string()));
    }
    let tag = format!("{}-{}", source_revision, suffix);
    let valid_chars = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid_chars || tag.len() > MAX_TAG_LEN || tag.starts_with(['.', '-']) {
        return Err(Error::InvalidInput(format!("invalid image tag: {}", tag)));
    }
    Ok(tag)
}

/// Status of a build execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Running,
    Succeeded,
    Failed { message: String },
}

/// One run of a Build stage. Kept as a historical record once terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildExecution {
    pub id: ResourceId,
    pub application: String,
    pub source_revision: String,
    pub tag_suffix: TagSuffix,
    pub target: RegistryCoordinate,
    /// Parameter store key the tag is published under.
    pub parameter_key: String,
    /// Set once the push succeeded.
    pub image_tag: Option<String>,
    /// Registry digest of the pushed image.
    pub digest: Option<String>,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildExecution {
    pub fn start(
        application: impl Into<String>,
        source_revision: impl Into<String>,
        started_at: DateTime<Utc>,
        target: RegistryCoordinate,
        parameter_key: impl Into<String>,
    ) -> Result<Self> {
        let source_revision = source_revision.into();
        let tag_suffix = TagSuffix::from_time(started_at);
        image_tag(&source_revision, tag_suffix)?;

        Ok(Self {
            id: ResourceId::new(),
            application: application.into(),
            source_revision,
            tag_suffix,
            target,
            parameter_key: parameter_key.into(),
            image_tag: None,
            digest: None,
            status: BuildStatus::Running,
            started_at,
            finished_at: None,
        })
    }

    /// The tag this execution pushes under.
    pub fn planned_tag(&self) -> String {
        format!("{}-{}", self.source_revision, self.tag_suffix)
    }

    pub fn planned_image(&self) -> ImageReference {
        self.target.image(self.planned_tag())
    }

    /// The pushed image, once there is one.
    pub fn image(&self) -> Option<ImageReference> {
        self.image_tag.as_ref().map(|tag| self.target.image(tag.clone()))
    }

    /// Record a successful push. Allowed once, while running.
    pub fn record_push(&mut self, receipt: &PushReceipt) -> Result<()> {
        if self.status != BuildStatus::Running || self.image_tag.is_some() {
            return Err(Error::Conflict(format!(
                "build {} already recorded a push",
                self.id
            )));
        }
        if receipt.reference != self.planned_image() {
            return Err(Error::InvalidInput(format!(
                "pushed {} but build {} planned {}",
                receipt.reference,
                self.id,
                self.planned_image()
            )));
        }
        self.image_tag = Some(receipt.reference.tag.clone());
        self.digest = Some(receipt.digest.clone());
        Ok(())
    }

    pub fn succeed(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != BuildStatus::Running {
            return Err(Error::Conflict(format!("build {} already finished", self.id)));
        }
        if self.image_tag.is_none() {
            return Err(Error::Conflict(format!(
                "build {} cannot succeed without a pushed image",
                self.id
            )));
        }
        self.status = BuildStatus::Succeeded;
        self.finished_at = Some(at);
        Ok(())
    }

    /// Mark the execution failed. A no-op once terminal.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        if self.status == BuildStatus::Running {
            self.status = BuildStatus::Failed {
                message: message.into(),
            };
            self.finished_at = Some(at);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != BuildStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn target() -> RegistryCoordinate {
        RegistryCoordinate {
            host: "123.dkr.ecr.us-east-1.amazonaws.com".into(),
            repository: "flask-app".into(),
        }
    }

    #[test]
    fn test_tag_is_revision_then_suffix() {
        let suffix = TagSuffix::from_time(at(1_700_000_000));
        assert_eq!(image_tag("abc123", suffix).unwrap(), "abc123-1700000000");
        // Deterministic for a fixed clock.
        let clock = FixedClock(at(1_700_000_000));
        let again = image_tag("abc123", TagSuffix::from_time(clock.now())).unwrap();
        assert_eq!(again, "abc123-1700000000");
    }

    #[test]
    fn test_suffix_ignores_subsecond_precision() {
        let base = at(1_700_000_000);
        let later = base + chrono::Duration::milliseconds(900);
        assert_eq!(TagSuffix::from_time(base), TagSuffix::from_time(later));
    }

    #[test]
    fn test_invalid_revisions_rejected() {
        let suffix = TagSuffix::from_time(at(1));
        assert!(image_tag("", suffix).is_err());
        assert!(image_tag("feature/x", suffix).is_err());
        assert!(image_tag("-abc", suffix).is_err());
        assert!(image_tag(&"a".repeat(200), suffix).is_err());
    }

    #[test]
    fn test_system_clock_is_non_decreasing() {
        let clock = SystemClock::new();
        let mut prev = clock.now().timestamp();
        for _ in 0..100 {
            let next = clock.now().timestamp();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn test_execution_lifecycle() {
        let mut exec = BuildExecution::start("flask-app", "r1", at(42), target(), "FlaskApp").unwrap();
        assert_eq!(exec.planned_tag(), "r1-42");
        assert!(exec.image().is_none());
        // Cannot succeed before pushing.
        assert!(exec.succeed(at(43)).is_err());

        let receipt = PushReceipt {
            reference: exec.planned_image(),
            digest: "sha256:feed".into(),
        };
        exec.record_push(&receipt).unwrap();
        assert!(exec.record_push(&receipt).is_err());

        exec.succeed(at(50)).unwrap();
        assert_eq!(exec.status, BuildStatus::Succeeded);
        assert_eq!(exec.image().unwrap().tag, "r1-42");

        // Immutable once terminal.
        exec.fail("late", at(60));
        assert_eq!(exec.status, BuildStatus::Succeeded);
        assert_eq!(exec.finished_at, Some(at(50)));
    }

    #[test]
    fn test_record_push_rejects_foreign_reference() {
        let mut exec = BuildExecution::start("flask-app", "r1", at(42), target(), "FlaskApp").unwrap();
        let receipt = PushReceipt {
            reference: target().image("other-1"),
            digest: "sha256:feed".into(),
        };
        assert!(matches!(exec.record_push(&receipt), Err(Error::InvalidInput(_))));
        assert!(exec.image_tag.is_none());
    }

    #[test]
    fn test_failed_execution_has_no_image() {
        let mut exec = BuildExecution::start("flask-app", "r1", at(42), target(), "FlaskApp").unwrap();
        exec.fail("push refused", at(44));
        assert!(exec.is_terminal());
        assert!(exec.image().is_none());
        assert_eq!(
            exec.status,
            BuildStatus::Failed {
                message: "push refused".into()
            }
        );
    }
}
