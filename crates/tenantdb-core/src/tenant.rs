//! Tenant lifecycle: a user owns one volume from creation and any number of
//! containers on it; deleting the user tears all of it down.

use crate::config::TenantConfig;
use crate::error::{CoreError, EntityKind, Result};
use crate::models::{User, Volume};
use crate::provisioner::ContainerProvisioner;
use crate::registry::Registry;
use crate::volume::VolumeLifecycleManager;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

/// Request to create a user. Missing fields take the [`TenantConfig`]
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub username: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub quota_mb: Option<u64>,
}

impl NewUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn quota_mb(mut self, quota_mb: u64) -> Self {
        self.quota_mb = Some(quota_mb);
        self
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }
}

/// Usernames become part of volume, directory and container names.
fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(CoreError::Validation("username is required".into()));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CoreError::Validation(format!(
            "username '{username}' may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

/// Ties users to their volumes and containers.
pub struct TenantService {
    registry: Arc<dyn Registry>,
    volumes: Arc<VolumeLifecycleManager>,
    containers: Arc<ContainerProvisioner>,
    config: TenantConfig,
}

impl TenantService {
    pub fn new(
        registry: Arc<dyn Registry>,
        volumes: Arc<VolumeLifecycleManager>,
        containers: Arc<ContainerProvisioner>,
        config: TenantConfig,
    ) -> Self {
        Self {
            registry,
            volumes,
            containers,
            config,
        }
    }

    /// Register a user and create their volume sized to the quota.
    ///
    /// If the volume cannot be created the user row is removed again.
    pub async fn create_user(&self, request: NewUser) -> Result<(User, Volume)> {
        validate_username(&request.username)?;
        let quota_mb = request.quota_mb.unwrap_or(self.config.default_quota_mb);
        if quota_mb == 0 {
            return Err(CoreError::Validation("quota_mb must be > 0".into()));
        }

        let user = User {
            username: request.username,
            tier: request
                .tier
                .unwrap_or_else(|| self.config.default_tier.clone()),
            quota_mb,
            created_at: Utc::now(),
        };
        self.registry.insert_user(&user).await?;
        tracing::info!(user = %user.username, tier = %user.tier, quota_mb, "User registered");

        match self.volumes.create(&user.username, quota_mb).await {
            Ok(volume) => Ok((user, volume)),
            Err(e) => {
                tracing::error!(user = %user.username, error = %e, "Volume creation failed, removing user");
                if let Err(del) = self.registry.delete_user(&user.username).await {
                    tracing::warn!(user = %user.username, error = %del, "Failed to remove user row");
                }
                Err(e)
            }
        }
    }

    /// Remove a user's containers and volumes, then the user.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        self.get_user(username).await?;
        tracing::info!(user = %username, "Deleting user");

        let containers = self.containers.remove_all_for_owner(username).await?;
        let volumes = self.volumes.delete_all_for_owner(username).await?;
        self.registry.delete_user(username).await?;

        tracing::info!(user = %username, containers, volumes, "User deleted");
        Ok(())
    }

    pub async fn get_user(&self, username: &str) -> Result<User> {
        self.registry
            .get_user(username)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::User, username))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.registry.list_users().await
    }
}
