//! Request and response bodies for the HTTP API.
//!
//! Domain records (`User`, `Volume`, `Container`, `VolumeUsage`) are
//! serialized as-is; the types here cover request parameters and the
//! responses that combine or wrap them.

use serde::{Deserialize, Serialize};
use tenantdb_core::{User, Volume};

// ============================================================================
// Users
// ============================================================================

/// Result of creating a user.
#[derive(Debug, Serialize)]
pub struct CreateUserResult {
    pub user: User,
    /// Volume created for the user with their quota.
    pub volume: Volume,
}

/// Result of deleting a user.
#[derive(Debug, Serialize)]
pub struct DeleteUserResult {
    pub username: String,
    pub deleted: bool,
}

// ============================================================================
// Volumes
// ============================================================================

/// Parameters for growing a volume.
#[derive(Debug, Deserialize)]
pub struct GrowParams {
    /// Megabytes to add.
    pub add_mb: u64,
}

/// Parameters for shrinking a volume.
#[derive(Debug, Deserialize)]
pub struct ShrinkParams {
    /// Megabytes to remove.
    pub reduce_mb: u64,
}

// ============================================================================
// Containers
// ============================================================================

/// Parameters for creating a database container.
#[derive(Debug, Deserialize)]
pub struct CreateContainerParams {
    /// Username owning the container.
    pub owner: String,
    /// Engine kind: `mysql` or `postgres`.
    pub kind: String,
}

/// Result of a start, stop or remove request.
#[derive(Debug, Serialize)]
pub struct ContainerActionResult {
    pub name: String,
    pub action: &'static str,
}
