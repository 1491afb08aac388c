use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy shared by the enforcement components.
///
/// None of these terminate the daemon: a failed step leaves the persisted
/// state where it was and the next scheduled tick retries.
#[derive(Error, Debug)]
pub enum EnforceError {
    #[error("Whitelist unreachable: {0}")]
    FetchUnreachable(String),

    #[error("Whitelist rejected: {0}")]
    Parse(String),

    #[error("Failed to write {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Apply failed: {0}")]
    Apply(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EnforceError {
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigWrite {
            path: path.into(),
            source,
        }
    }

    pub fn apply(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Apply(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, EnforceError>;
