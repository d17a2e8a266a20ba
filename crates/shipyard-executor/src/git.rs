//! Source provider backed by a local git checkout.

use async_trait::async_trait;
use shipyard_core::source::{SourceLocator, SourceProvider, SourceRevision};
use shipyard_core::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Resolves revisions from a checkout on disk, or from a pinned commit.
#[derive(Debug, Clone)]
pub struct GitSource {
    checkout: PathBuf,
    pinned: Option<String>,
}

impl GitSource {
    /// Resolve `HEAD` of the checkout at `path`.
    pub fn new(checkout: impl Into<PathBuf>) -> Self {
        Self {
            checkout: checkout.into(),
            pinned: None,
        }
    }

    /// Always resolve to `commit` without touching git.
    pub fn pinned(commit: impl Into<String>) -> Self {
        Self {
            checkout: PathBuf::from("."),
            pinned: Some(commit.into()),
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.checkout)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Internal(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(checkout = %self.checkout.display(), "git {} failed", args.join(" "));
            return Err(Error::NotFound(format!(
                "{}: {}",
                self.checkout.display(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn resolve(&self, locator: &SourceLocator) -> Result<SourceRevision> {
        let commit = match &self.pinned {
            Some(commit) => commit.clone(),
            None => self.run_git(&["rev-parse", "HEAD"]).await?,
        };
        if commit.is_empty() {
            return Err(Error::NotFound(format!(
                "no revision for {}",
                locator.repository()
            )));
        }

        debug!(repository = %locator.repository(), commit = %commit, "Resolved source revision");
        Ok(SourceRevision {
            commit,
            branch: locator.branch().to_string(),
            repository: locator.repository(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> SourceLocator {
        SourceLocator::CodeCommit {
            repository: "chat-app".into(),
            branch: "main".into(),
        }
    }

    #[tokio::test]
    async fn test_pinned_revision() {
        let source = GitSource::pinned("8f2c1d0");
        let revision = source.resolve(&locator()).await.unwrap();
        assert_eq!(revision.commit, "8f2c1d0");
        assert_eq!(revision.branch, "main");
        assert_eq!(revision.repository, "chat-app");
    }

    #[tokio::test]
    async fn test_non_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = GitSource::new(dir.path());
        assert!(source.resolve(&locator()).await.is_err());
    }

    /// Requires git on PATH.
    #[tokio::test]
    #[ignore]
    async fn test_resolves_head() {
        let dir = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap()
        };
        git(&["init", "-q"]);
        git(&[
            "-c",
            "user.email=ci@example.com",
            "-c",
            "user.name=ci",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            "init",
        ]);

        let revision = GitSource::new(dir.path()).resolve(&locator()).await.unwrap();
        assert_eq!(revision.commit.len(), 40);
    }
}
