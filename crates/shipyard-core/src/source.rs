//! Source control locators and the resolver interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Where a pipeline's source lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceLocator {
    /// A hosted repository reached through a named connection.
    Connection {
        owner: String,
        repo: String,
        branch: String,
        /// Connection identity (ARN).
        connection: String,
    },
    /// A repository hosted by the provider itself.
    CodeCommit { repository: String, branch: String },
}

impl SourceLocator {
    pub fn branch(&self) -> &str {
        match self {
            SourceLocator::Connection { branch, .. } => branch,
            SourceLocator::CodeCommit { branch, .. } => branch,
        }
    }

    /// Repository display name ("owner/repo" for connections).
    pub fn repository(&self) -> String {
        match self {
            SourceLocator::Connection { owner, repo, .. } => format!("{}/{}", owner, repo),
            SourceLocator::CodeCommit { repository, .. } => repository.clone(),
        }
    }
}

/// A resolved checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevision {
    /// Resolved commit identifier.
    pub commit: String,
    pub branch: String,
    pub repository: String,
}

/// Trait for source control backends.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Resolve a locator to the commit a build should run against.
    async fn resolve(&self, locator: &SourceLocator) -> Result<SourceRevision>;
}
