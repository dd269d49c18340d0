//! Error types for tenantdb-core.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for tenantdb-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Kind of registry entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Volume,
    Container,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Volume => write!(f, "volume"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// Errors that can occur during volume and container operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Request rejected before any side effect (bad engine kind, missing
    /// volume, shrink below used space, bad username).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown user, volume or container reference
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Entity kind
        kind: EntityKind,
        /// Reference that was looked up
        name: String,
    },

    /// A toolchain or container runtime call failed
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Registry uniqueness violation
    #[error("already exists: {0}")]
    Duplicate(String),

    /// Registry storage error other than a uniqueness violation
    #[error("registry error: {0}")]
    Registry(#[source] sqlx::Error),
}

impl CoreError {
    pub(crate) fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Returns true for errors caused by the request rather than the host.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound { .. } | Self::Duplicate(_)
        )
    }
}

impl From<ToolError> for CoreError {
    fn from(err: ToolError) -> Self {
        Self::Provisioning(err.to_string())
    }
}

impl From<bollard::errors::Error> for CoreError {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Provisioning(format!("container runtime: {err}"))
    }
}

/// Errors raised by a single filesystem toolchain step.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be spawned at all
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited non-zero
    #[error("{program} exited with code {code}: {stderr}")]
    Exit {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The tool did not finish in time
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The path is not the root of a mounted filesystem
    #[error("{path} is not a mount point")]
    NotMounted { path: String },

    /// Direct filesystem operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
