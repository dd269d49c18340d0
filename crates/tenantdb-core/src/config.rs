//! Configuration types for the volume manager and container provisioner.

use crate::error::CoreError;
use crate::port::PortRange;
use std::path::PathBuf;

/// Configuration for [`VolumeLifecycleManager`](crate::VolumeLifecycleManager).
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Directory holding the backing image files.
    pub images_dir: PathBuf,
    /// Directory under which each volume gets its mount point.
    pub mount_root: PathBuf,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("/var/lib/docker-imgs"),
            mount_root: PathBuf::from("/mnt"),
        }
    }
}

impl VolumeConfig {
    /// Create a new config builder.
    pub fn builder() -> VolumeConfigBuilder {
        VolumeConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.images_dir.is_absolute() {
            return Err(CoreError::Validation(
                "images_dir must be an absolute path".into(),
            ));
        }
        if !self.mount_root.is_absolute() {
            return Err(CoreError::Validation(
                "mount_root must be an absolute path".into(),
            ));
        }
        Ok(())
    }

    /// Backing image path for a volume name.
    pub fn image_path(&self, volume: &str) -> PathBuf {
        self.images_dir.join(format!("{volume}.img"))
    }

    /// Mount point for a volume name.
    pub fn mount_path(&self, volume: &str) -> PathBuf {
        self.mount_root.join(volume)
    }
}

/// Builder for VolumeConfig.
#[derive(Debug, Default)]
pub struct VolumeConfigBuilder {
    config: VolumeConfig,
}

impl VolumeConfigBuilder {
    /// Set the image directory.
    pub fn images_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.images_dir = path.into();
        self
    }

    /// Set the mount root.
    pub fn mount_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mount_root = path.into();
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<VolumeConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for [`ContainerProvisioner`](crate::ContainerProvisioner).
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Host ports handed out to containers.
    pub port_range: PortRange,
    /// Login recorded for the engine's administrative account.
    pub root_login: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            root_login: "root".to_string(),
        }
    }
}

/// Defaults applied by [`TenantService`](crate::TenantService) to new users.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub default_tier: String,
    /// Quota, and so initial volume capacity, when none is requested.
    pub default_quota_mb: u64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            default_tier: "user".to_string(),
            default_quota_mb: 1024,
        }
    }
}
