//! Domain records persisted in the registry.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A tenant owning volumes and containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Free-form tier label (e.g. "user", "premium").
    pub tier: String,
    /// Storage ceiling, used as the capacity of the user's volume.
    pub quota_mb: u64,
    pub created_at: DateTime<Utc>,
}

/// Persisted lifecycle status of a volume.
///
/// Anything other than `Ready` after a restart means a multi-step chain was
/// interrupted and the volume may be unmounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    /// Image allocation, format and mount in progress.
    Provisioning,
    /// Mounted and usable.
    Ready,
    /// Unmounted for a grow or shrink.
    Resizing,
    /// A chain failed part way; needs recovery.
    Degraded,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Resizing => "resizing",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "ready" => Ok(Self::Ready),
            "resizing" => Ok(Self::Resizing),
            "degraded" => Ok(Self::Degraded),
            other => Err(CoreError::Validation(format!(
                "unknown volume status '{other}'"
            ))),
        }
    }
}

/// A capacity-bounded volume backed by a loop-mounted image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub owner: String,
    pub mount_path: PathBuf,
    pub capacity_mb: u64,
    pub image_path: PathBuf,
    pub status: VolumeStatus,
    pub created_at: DateTime<Utc>,
}

/// Space usage of a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub volume: String,
    pub used_mb: u64,
    pub total_mb: u64,
    /// Percentage as reported by the filesystem, e.g. "12%".
    pub percent: String,
}

/// Database engine a container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Mysql,
    Postgres,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Image launched for this engine.
    pub fn image(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql:8.0",
            Self::Postgres => "postgres:15",
        }
    }

    /// TCP port the engine listens on inside the container.
    pub fn protocol_port(&self) -> u16 {
        match self {
            Self::Mysql => 3306,
            Self::Postgres => 5432,
        }
    }

    /// Data directory inside the container, bound to the volume subfolder.
    pub fn data_dir(&self) -> &'static str {
        match self {
            Self::Mysql => "/var/lib/mysql",
            Self::Postgres => "/var/lib/postgresql/data",
        }
    }

    /// Environment variable carrying the root password.
    pub fn password_env(&self) -> &'static str {
        match self {
            Self::Mysql => "MYSQL_ROOT_PASSWORD",
            Self::Postgres => "POSTGRES_PASSWORD",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" => Ok(Self::Mysql),
            "postgres" => Ok(Self::Postgres),
            other => Err(CoreError::Validation(format!(
                "engine kind must be 'mysql' or 'postgres', got '{other}'"
            ))),
        }
    }
}

/// A provisioned database container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Id assigned by the container runtime.
    pub id: String,
    pub name: String,
    pub owner: String,
    pub kind: EngineKind,
    pub root_login: String,
    pub root_password: String,
    pub host_port: u16,
    /// Volume whose mount path hosts the data subdirectory.
    pub volume: String,
    pub data_path: PathBuf,
    pub created_at: DateTime<Utc>,
}
