//! Error types for Shipyard.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    // Stack graph
    #[error("cycle detected: {path}")]
    Cycle { node: String, path: String },

    #[error("stack '{node}' has prerequisites not yet provisioned: {}", missing.join(", "))]
    PrerequisiteNotMet { node: String, missing: Vec<String> },

    // Pipeline definition
    #[error(
        "artifact mismatch at stage '{stage}': expected input {expected}, found {found}"
    )]
    ArtifactTypeMismatch {
        stage: String,
        expected: String,
        found: String,
    },

    #[error("pipeline '{0}' has no source stage")]
    EmptyPipeline(String),

    // Artifact channel
    #[error("artifact '{0}' already published")]
    AlreadyPublished(String),

    #[error("artifact '{0}' not yet published")]
    NotReady(String),

    // Stage execution
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors a stage-level retry policy may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Network(_) | Error::Permission(_)
        )
    }

    /// Errors raised while validating definitions. These are never retried.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Error::Cycle { .. }
                | Error::PrerequisiteNotMet { .. }
                | Error::ArtifactTypeMismatch { .. }
                | Error::EmptyPipeline(_)
                | Error::AlreadyPublished(_)
                | Error::NotReady(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Auth("expired".into()).is_retryable());
        assert!(Error::Permission("ssm:PutParameter".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::EmptyPipeline("p".into()).is_retryable());
    }

    #[test]
    fn test_definition_errors_are_not_retryable() {
        let err = Error::ArtifactTypeMismatch {
            stage: "build".into(),
            expected: "SourceOutput".into(),
            found: "none".into(),
        };
        assert!(err.is_definition_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_prerequisite_message_lists_missing() {
        let err = Error::PrerequisiteNotMet {
            node: "cluster".into(),
            missing: vec!["network".into(), "registry".into()],
        };
        assert_eq!(
            err.to_string(),
            "stack 'cluster' has prerequisites not yet provisioned: network, registry"
        );
    }
}
