//! Metadata registry interface.
//!
//! The registry is the durable record of users, volumes and containers. It is
//! treated as an opaque keyed store: every method is a single statement, and
//! uniqueness (username, volume name, container name, host port) is enforced
//! by the store itself so that callers can rely on insert-if-absent semantics.

use crate::error::Result;
use crate::models::{Container, User, Volume, VolumeStatus};
use async_trait::async_trait;
use std::collections::HashSet;

/// CRUD access to persisted users, volumes and containers.
///
/// Inserts fail with [`CoreError::Duplicate`](crate::CoreError::Duplicate)
/// when a unique key is already present. Updates of missing rows fail with
/// [`CoreError::NotFound`](crate::CoreError::NotFound). Deletes return whether
/// a row was removed.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, username: &str) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn delete_user(&self, username: &str) -> Result<bool>;

    async fn insert_volume(&self, volume: &Volume) -> Result<()>;
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>>;
    async fn list_volumes(&self) -> Result<Vec<Volume>>;
    /// Volumes of one owner, oldest first.
    async fn list_volumes_for_owner(&self, owner: &str) -> Result<Vec<Volume>>;
    async fn update_volume_capacity(&self, name: &str, capacity_mb: u64) -> Result<()>;
    async fn set_volume_status(&self, name: &str, status: VolumeStatus) -> Result<()>;
    async fn delete_volume(&self, name: &str) -> Result<bool>;

    async fn insert_container(&self, container: &Container) -> Result<()>;
    /// Looks a container up by name or by runtime id.
    async fn get_container(&self, reference: &str) -> Result<Option<Container>>;
    async fn list_containers(&self) -> Result<Vec<Container>>;
    async fn list_containers_for_owner(&self, owner: &str) -> Result<Vec<Container>>;
    async fn delete_container(&self, name: &str) -> Result<bool>;
    /// Host ports held by registered containers.
    async fn used_ports(&self) -> Result<HashSet<u16>>;
}
