//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("cycle detected in dependencies: {0}")]
    CycleDetected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<shipyard_core::Error> for ConfigError {
    fn from(err: shipyard_core::Error) -> Self {
        use shipyard_core::Error;
        match err {
            Error::Cycle { path, .. } => ConfigError::CycleDetected(path),
            Error::Conflict(msg) => ConfigError::Duplicate(msg),
            Error::NotFound(msg) => ConfigError::InvalidReference(msg),
            other => ConfigError::InvalidValue {
                field: "topology".to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
