//! Volume lifecycle: create, grow, shrink, usage and teardown of
//! loopback-image-backed volumes.
//!
//! Every multi-step chain persists the volume's [`VolumeStatus`] before it
//! touches the mount, so a chain interrupted by a crash or a failing tool is
//! visible in the registry (`resizing` / `degraded`) and can be repaired with
//! [`VolumeLifecycleManager::recover_interrupted`].

use crate::config::VolumeConfig;
use crate::error::{CoreError, EntityKind, Result, ToolError};
use crate::models::{Volume, VolumeStatus, VolumeUsage};
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;
use crate::toolchain::Toolchain;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Usage of one volume, or the reason it could not be read.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub volume: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<VolumeUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Steps of [`VolumeLifecycleManager::create`] that completed, for rollback.
#[derive(Debug, Default)]
struct CreateProgress {
    image: bool,
    mount_dir: bool,
    mounted: bool,
}

/// Orchestrates the filesystem toolchain and the registry to manage volumes.
///
/// # Thread Safety
///
/// Grow, shrink and recovery hold a manager-wide lock for their whole chain.
/// They still assume no I/O reaches the volume while it is unmounted.
pub struct VolumeLifecycleManager {
    registry: Arc<dyn Registry>,
    tools: Arc<dyn Toolchain>,
    runtime: Arc<dyn ContainerRuntime>,
    config: VolumeConfig,
    resize_lock: Mutex<()>,
}

impl VolumeLifecycleManager {
    /// Create a new volume manager.
    pub fn new(
        registry: Arc<dyn Registry>,
        tools: Arc<dyn Toolchain>,
        runtime: Arc<dyn ContainerRuntime>,
        config: VolumeConfig,
    ) -> Self {
        tracing::info!(
            images_dir = %config.images_dir.display(),
            mount_root = %config.mount_root.display(),
            "Creating volume manager"
        );
        Self {
            registry,
            tools,
            runtime,
            config,
            resize_lock: Mutex::new(()),
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    fn generate_name(owner: &str) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{owner}_{}", &id[..8])
    }

    /// Create a volume of `capacity_mb` for `owner`.
    ///
    /// The registry row is reserved first in `provisioning` status, which
    /// makes the name unique before any file is created. On failure the
    /// completed steps and the row are rolled back.
    pub async fn create(&self, owner: &str, capacity_mb: u64) -> Result<Volume> {
        if owner.is_empty() {
            return Err(CoreError::Validation("volume owner is required".into()));
        }
        if capacity_mb == 0 {
            return Err(CoreError::Validation("capacity_mb must be > 0".into()));
        }

        let start = std::time::Instant::now();
        let name = Self::generate_name(owner);
        let mut volume = Volume {
            mount_path: self.config.mount_path(&name),
            image_path: self.config.image_path(&name),
            name,
            owner: owner.to_string(),
            capacity_mb,
            status: VolumeStatus::Provisioning,
            created_at: Utc::now(),
        };
        tracing::info!(volume = %volume.name, owner, capacity_mb, "Creating volume");

        self.registry.insert_volume(&volume).await?;

        let mut progress = CreateProgress::default();
        if let Err(e) = self.provision(&volume, &mut progress).await {
            tracing::error!(volume = %volume.name, error = %e, "Volume creation failed, rolling back");
            self.rollback_create(&volume, &progress).await;
            return Err(e);
        }

        self.registry
            .set_volume_status(&volume.name, VolumeStatus::Ready)
            .await?;
        volume.status = VolumeStatus::Ready;

        tracing::info!(
            volume = %volume.name,
            owner,
            capacity_mb,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Volume created"
        );
        Ok(volume)
    }

    async fn provision(&self, volume: &Volume, progress: &mut CreateProgress) -> Result<()> {
        tracing::debug!(volume = %volume.name, image = %volume.image_path.display(), "Allocating image");
        self.tools
            .allocate(&volume.image_path, volume.capacity_mb)
            .await?;
        progress.image = true;

        tracing::debug!(volume = %volume.name, "Formatting image");
        self.tools.format(&volume.image_path).await?;

        self.tools.make_dir(&volume.mount_path).await?;
        progress.mount_dir = true;

        tracing::debug!(volume = %volume.name, mount = %volume.mount_path.display(), "Mounting image");
        self.tools
            .mount_loop(&volume.image_path, &volume.mount_path)
            .await?;
        progress.mounted = true;

        self.runtime
            .create_storage_endpoint(&volume.name, &volume.mount_path)
            .await?;
        Ok(())
    }

    async fn rollback_create(&self, volume: &Volume, progress: &CreateProgress) {
        if progress.mounted {
            if let Err(e) = self.tools.unmount(&volume.mount_path).await {
                tracing::warn!(volume = %volume.name, error = %e, "Rollback: unmount failed");
            }
        }
        if progress.mount_dir {
            if let Err(e) = self.tools.remove_dir(&volume.mount_path).await {
                tracing::warn!(volume = %volume.name, error = %e, "Rollback: mount dir removal failed");
            }
        }
        if progress.image {
            if let Err(e) = self.tools.remove_file(&volume.image_path).await {
                tracing::warn!(volume = %volume.name, error = %e, "Rollback: image removal failed");
            }
        }
        if let Err(e) = self.registry.delete_volume(&volume.name).await {
            tracing::warn!(volume = %volume.name, error = %e, "Rollback: registry row removal failed");
        }
    }

    /// Look up a volume by name.
    pub async fn get(&self, name: &str) -> Result<Volume> {
        self.registry
            .get_volume(name)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Volume, name))
    }

    /// List all volumes.
    pub async fn list(&self) -> Result<Vec<Volume>> {
        self.registry.list_volumes().await
    }

    /// List the volumes of one owner, oldest first.
    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<Volume>> {
        self.registry.list_volumes_for_owner(owner).await
    }

    /// The owner's first registered volume, if any.
    pub async fn first_for_owner(&self, owner: &str) -> Result<Option<Volume>> {
        Ok(self
            .registry
            .list_volumes_for_owner(owner)
            .await?
            .into_iter()
            .next())
    }

    fn ensure_ready(volume: &Volume) -> Result<()> {
        if volume.status != VolumeStatus::Ready {
            return Err(CoreError::Validation(format!(
                "volume {} is {}, recover it before resizing",
                volume.name, volume.status
            )));
        }
        Ok(())
    }

    /// Grow a volume by `add_mb`.
    ///
    /// Chain: unmount, extend image, fsck, resize filesystem to the image,
    /// remount. A failing step leaves the volume `degraded` and as-is.
    pub async fn grow(&self, name: &str, add_mb: u64) -> Result<Volume> {
        if add_mb == 0 {
            return Err(CoreError::Validation("add_mb must be > 0".into()));
        }
        let _guard = self.resize_lock.lock().await;
        let mut volume = self.get(name).await?;
        Self::ensure_ready(&volume)?;

        let new_capacity = volume
            .capacity_mb
            .checked_add(add_mb)
            .ok_or_else(|| CoreError::Validation("capacity overflow".into()))?;
        tracing::info!(volume = %name, from_mb = volume.capacity_mb, to_mb = new_capacity, "Growing volume");

        self.registry
            .set_volume_status(name, VolumeStatus::Resizing)
            .await?;

        let chain = async {
            self.tools.unmount(&volume.mount_path).await?;
            self.tools.extend(&volume.image_path, new_capacity).await?;
            self.tools.check(&volume.image_path).await?;
            self.tools.resize(&volume.image_path, None).await?;
            self.tools
                .mount_loop(&volume.image_path, &volume.mount_path)
                .await
        };
        self.finish_chain(name, "grow", chain.await).await?;

        self.registry
            .update_volume_capacity(name, new_capacity)
            .await?;
        self.registry
            .set_volume_status(name, VolumeStatus::Ready)
            .await?;
        volume.capacity_mb = new_capacity;
        volume.status = VolumeStatus::Ready;

        tracing::info!(volume = %name, capacity_mb = new_capacity, "Volume grown");
        Ok(volume)
    }

    /// Shrink a volume by `reduce_mb`.
    ///
    /// Rejected when the new capacity would be below the space in use.
    /// The filesystem is shrunk before the image is truncated, so the
    /// filesystem never exceeds its backing file.
    pub async fn shrink(&self, name: &str, reduce_mb: u64) -> Result<Volume> {
        if reduce_mb == 0 {
            return Err(CoreError::Validation("reduce_mb must be > 0".into()));
        }
        let _guard = self.resize_lock.lock().await;
        let mut volume = self.get(name).await?;
        Self::ensure_ready(&volume)?;

        if reduce_mb >= volume.capacity_mb {
            return Err(CoreError::Validation(format!(
                "cannot reduce {name} by {reduce_mb}MB: capacity is {}MB",
                volume.capacity_mb
            )));
        }
        let new_capacity = volume.capacity_mb - reduce_mb;

        let used_mb = self.usage_of(&volume).await?.used_mb;
        if new_capacity < used_mb {
            return Err(CoreError::Validation(format!(
                "cannot reduce {name} by {reduce_mb}MB: {used_mb}MB in use"
            )));
        }
        tracing::info!(
            volume = %name,
            from_mb = volume.capacity_mb,
            to_mb = new_capacity,
            used_mb,
            "Shrinking volume"
        );

        self.registry
            .set_volume_status(name, VolumeStatus::Resizing)
            .await?;

        let chain = async {
            self.tools.unmount(&volume.mount_path).await?;
            self.tools.check(&volume.image_path).await?;
            self.tools
                .resize(&volume.image_path, Some(new_capacity))
                .await?;
            self.tools.truncate(&volume.image_path, new_capacity).await?;
            self.tools
                .mount_loop(&volume.image_path, &volume.mount_path)
                .await
        };
        self.finish_chain(name, "shrink", chain.await).await?;

        self.registry
            .update_volume_capacity(name, new_capacity)
            .await?;
        self.registry
            .set_volume_status(name, VolumeStatus::Ready)
            .await?;
        volume.capacity_mb = new_capacity;
        volume.status = VolumeStatus::Ready;

        tracing::info!(volume = %name, capacity_mb = new_capacity, "Volume shrunk");
        Ok(volume)
    }

    /// Mark the volume degraded if a resize chain failed.
    async fn finish_chain(
        &self,
        name: &str,
        op: &str,
        outcome: std::result::Result<(), ToolError>,
    ) -> Result<()> {
        let Err(e) = outcome else {
            return Ok(());
        };
        tracing::error!(volume = %name, op, error = %e, "Volume chain failed");
        if let Err(status_err) = self
            .registry
            .set_volume_status(name, VolumeStatus::Degraded)
            .await
        {
            tracing::error!(volume = %name, error = %status_err, "Failed to mark volume degraded");
        }
        Err(e.into())
    }

    /// Space usage of a volume.
    pub async fn usage(&self, name: &str) -> Result<VolumeUsage> {
        let volume = self.get(name).await?;
        self.usage_of(&volume).await
    }

    async fn usage_of(&self, volume: &Volume) -> Result<VolumeUsage> {
        match self.tools.usage(&volume.mount_path).await? {
            Some(fs) => Ok(VolumeUsage {
                volume: volume.name.clone(),
                used_mb: fs.used_mb,
                total_mb: fs.total_mb,
                percent: fs.percent,
            }),
            None => {
                tracing::debug!(volume = %volume.name, "Usage unavailable, reporting empty volume");
                Ok(VolumeUsage {
                    volume: volume.name.clone(),
                    used_mb: 0,
                    total_mb: volume.capacity_mb,
                    percent: "0%".to_string(),
                })
            }
        }
    }

    /// Usage of every registered volume; per-volume failures are reported
    /// inline instead of failing the whole listing.
    pub async fn usage_all(&self) -> Result<Vec<UsageReport>> {
        let volumes = self.registry.list_volumes().await?;
        let mut reports = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let report = match self.usage_of(&volume).await {
                Ok(usage) => UsageReport {
                    volume: volume.name,
                    usage: Some(usage),
                    error: None,
                },
                Err(e) => UsageReport {
                    volume: volume.name,
                    usage: None,
                    error: Some(e.to_string()),
                },
            };
            reports.push(report);
        }
        Ok(reports)
    }

    /// Tear down every volume owned by `owner`.
    ///
    /// Best-effort: each step's failure is logged and the teardown moves on,
    /// always attempting to delete the registry row. Safe to call repeatedly.
    /// Returns the number of registry rows removed.
    pub async fn delete_all_for_owner(&self, owner: &str) -> Result<usize> {
        let volumes = self.registry.list_volumes_for_owner(owner).await?;
        tracing::info!(owner, count = volumes.len(), "Deleting volumes for owner");

        let mut removed = 0;
        for volume in volumes {
            if let Err(e) = self.runtime.remove_storage_endpoint(&volume.name).await {
                tracing::warn!(volume = %volume.name, error = %e, "Failed to remove storage endpoint");
            }
            if let Err(e) = self.tools.unmount(&volume.mount_path).await {
                tracing::debug!(volume = %volume.name, error = %e, "Unmount failed, continuing");
            }
            if self.tools.exists(&volume.image_path).await {
                if let Err(e) = self.tools.remove_file(&volume.image_path).await {
                    tracing::warn!(volume = %volume.name, error = %e, "Failed to remove image");
                }
            }
            if self.tools.exists(&volume.mount_path).await {
                if let Err(e) = self.tools.remove_dir(&volume.mount_path).await {
                    tracing::warn!(volume = %volume.name, error = %e, "Failed to remove mount dir");
                }
            }
            match self.registry.delete_volume(&volume.name).await {
                Ok(true) => {
                    removed += 1;
                    tracing::info!(volume = %volume.name, "Volume removed");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(volume = %volume.name, error = %e, "Failed to delete volume row");
                }
            }
        }
        Ok(removed)
    }

    /// Repair volumes whose persisted status shows an interrupted chain.
    ///
    /// `provisioning` volumes never finished creation and are torn down.
    /// `resizing` and `degraded` volumes are brought back to their recorded
    /// capacity (extend image, fsck, resize filesystem, truncate image) and
    /// remounted. `ready` volumes are not touched. Returns the names of the
    /// volumes that are `ready` again.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let _guard = self.resize_lock.lock().await;
        let stuck: Vec<Volume> = self
            .registry
            .list_volumes()
            .await?
            .into_iter()
            .filter(|v| v.status != VolumeStatus::Ready)
            .collect();
        if stuck.is_empty() {
            tracing::debug!("No interrupted volumes");
            return Ok(Vec::new());
        }
        tracing::warn!(count = stuck.len(), "Recovering interrupted volumes");

        let mut recovered = Vec::new();
        for volume in stuck {
            if volume.status == VolumeStatus::Provisioning {
                let progress = CreateProgress {
                    image: self.tools.exists(&volume.image_path).await,
                    mount_dir: self.tools.exists(&volume.mount_path).await,
                    mounted: true,
                };
                if let Err(e) = self.runtime.remove_storage_endpoint(&volume.name).await {
                    tracing::warn!(volume = %volume.name, error = %e, "Failed to remove storage endpoint");
                }
                self.rollback_create(&volume, &progress).await;
                tracing::info!(volume = %volume.name, "Discarded unfinished volume");
                continue;
            }

            match self.restore(&volume).await {
                Ok(()) => {
                    self.registry
                        .set_volume_status(&volume.name, VolumeStatus::Ready)
                        .await?;
                    tracing::info!(volume = %volume.name, "Volume recovered");
                    recovered.push(volume.name);
                }
                Err(e) => {
                    tracing::error!(volume = %volume.name, error = %e, "Volume recovery failed");
                    self.registry
                        .set_volume_status(&volume.name, VolumeStatus::Degraded)
                        .await?;
                }
            }
        }
        Ok(recovered)
    }

    async fn restore(&self, volume: &Volume) -> std::result::Result<(), ToolError> {
        if let Err(e) = self.tools.unmount(&volume.mount_path).await {
            tracing::debug!(volume = %volume.name, error = %e, "Not mounted");
        }
        self.tools
            .extend(&volume.image_path, volume.capacity_mb)
            .await?;
        self.tools.check(&volume.image_path).await?;
        self.tools
            .resize(&volume.image_path, Some(volume.capacity_mb))
            .await?;
        self.tools
            .truncate(&volume.image_path, volume.capacity_mb)
            .await?;
        self.tools.make_dir(&volume.mount_path).await?;
        self.tools
            .mount_loop(&volume.image_path, &volume.mount_path)
            .await
    }
}
