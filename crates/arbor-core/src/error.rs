use crate::pkg::error::PkgError;
use std::path::PathBuf;
use thiserror::Error;

/// Core error type for arbor operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Project root not found from {start}")]
    ProjectNotFound { start: PathBuf },

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The package error code, if this wraps one.
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Pkg(e) => Some(e.code()),
            _ => None,
        }
    }
}
