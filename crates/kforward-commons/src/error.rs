use std::fmt;

use thiserror::Error;

/// Error taxonomy for the forward control plane.
///
/// Mirrors the admission/retry split the control plane relies on: `InvalidConfig` and
/// `PortConflict` are returned to callers of `Start`/`Reload` and leave the system untouched,
/// while `Resolve`/`Connect` are absorbed by a Worker's own retry loop and never escape it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("port conflict: {0:?}")]
    PortConflict(Vec<PortConflict>),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("forward not found: {0}")]
    NotFound(String),

    #[error("forward already enabled: {0}")]
    AlreadyEnabled(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Fatal(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Fatal(value.to_string())
    }
}

/// A single local port that could not be admitted because another process already holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub port: u16,
    pub resource: String,
    pub used_by: Option<String>,
}

impl fmt::Display for PortConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.used_by {
            Some(owner) => write!(f, "port {} ({}) is in use by {}", self.port, self.resource, owner),
            None => write!(f, "port {} ({}) is in use", self.port, self.resource),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
