//! Database container provisioning on top of an owner's volume.

use crate::config::ProvisionerConfig;
use crate::credential::CredentialGenerator;
use crate::error::{CoreError, EntityKind, Result};
use crate::models::{Container, EngineKind, VolumeStatus};
use crate::port::PortAllocator;
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, LaunchSpec};
use crate::toolchain::Toolchain;
use crate::volume::VolumeLifecycleManager;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Creates and controls database containers.
///
/// Port allocation and container registration happen under one lock so two
/// concurrent creates never receive the same host port.
pub struct ContainerProvisioner {
    registry: Arc<dyn Registry>,
    volumes: Arc<VolumeLifecycleManager>,
    tools: Arc<dyn Toolchain>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    credentials: CredentialGenerator,
    root_login: String,
    alloc_lock: Mutex<()>,
}

impl ContainerProvisioner {
    pub fn new(
        registry: Arc<dyn Registry>,
        volumes: Arc<VolumeLifecycleManager>,
        tools: Arc<dyn Toolchain>,
        runtime: Arc<dyn ContainerRuntime>,
        config: ProvisionerConfig,
    ) -> Self {
        tracing::info!(
            port_min = config.port_range.min,
            port_max = config.port_range.max,
            "Creating container provisioner"
        );
        Self {
            registry,
            volumes,
            tools,
            runtime,
            ports: PortAllocator::new(config.port_range),
            credentials: CredentialGenerator::new(),
            root_login: config.root_login,
            alloc_lock: Mutex::new(()),
        }
    }

    /// Create and start a database container of `kind` for `owner`.
    ///
    /// The container's data lives in a fresh subdirectory of the owner's
    /// first volume.
    pub async fn create(&self, owner: &str, kind: &str) -> Result<Container> {
        let kind: EngineKind = kind.parse()?;
        let volume = self
            .volumes
            .first_for_owner(owner)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("user {owner} has no volume")))?;
        if volume.status != VolumeStatus::Ready {
            return Err(CoreError::Validation(format!(
                "volume {} is {}",
                volume.name, volume.status
            )));
        }

        let start = std::time::Instant::now();
        let id = Uuid::new_v4().simple().to_string();
        let suffix = &id[..8];
        let name = format!("{owner}_{kind}_{suffix}");
        let data_path = volume.mount_path.join(format!("{kind}_{suffix}"));
        tracing::info!(container = %name, owner, %kind, volume = %volume.name, "Creating container");

        self.tools.make_dir(&data_path).await?;
        let password = self.credentials.generate(owner);

        let _guard = self.alloc_lock.lock().await;
        let taken = match self.registry.used_ports().await {
            Ok(taken) => taken,
            Err(e) => {
                self.discard_data_dir(&data_path).await;
                return Err(e);
            }
        };
        let host_port = match self.ports.allocate(&taken) {
            Ok(port) => port,
            Err(e) => {
                self.discard_data_dir(&data_path).await;
                return Err(e);
            }
        };

        let spec = LaunchSpec {
            image: kind.image().to_string(),
            name: name.clone(),
            env: vec![(kind.password_env().to_string(), password.clone())],
            container_port: kind.protocol_port(),
            host_port,
            bind_source: data_path.clone(),
            bind_target: kind.data_dir().to_string(),
        };
        let handle = match self.runtime.run(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(container = %name, port = host_port, error = %e, "Container launch failed");
                self.discard_data_dir(&data_path).await;
                return Err(e);
            }
        };

        let container = Container {
            id: handle.id,
            name: handle.name,
            owner: owner.to_string(),
            kind,
            root_login: self.root_login.clone(),
            root_password: password,
            host_port,
            volume: volume.name,
            data_path,
            created_at: Utc::now(),
        };
        if let Err(e) = self.registry.insert_container(&container).await {
            tracing::error!(container = %container.name, error = %e, "Registering container failed, removing it");
            if let Err(rm) = self.runtime.remove(&container.name, true).await {
                tracing::warn!(container = %container.name, error = %rm, "Failed to remove unregistered container");
            }
            self.discard_data_dir(&container.data_path).await;
            return Err(e);
        }

        tracing::info!(
            container = %container.name,
            owner,
            port = host_port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Container created"
        );
        Ok(container)
    }

    async fn discard_data_dir(&self, path: &Path) {
        if let Err(e) = self.tools.remove_dir(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove data directory");
        }
    }

    /// Look up a container by name or runtime id.
    pub async fn get(&self, reference: &str) -> Result<Container> {
        self.registry
            .get_container(reference)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Container, reference))
    }

    pub async fn start(&self, reference: &str) -> Result<Container> {
        let container = self.get(reference).await?;
        self.runtime.start(&container.name).await?;
        tracing::info!(container = %container.name, "Container started");
        Ok(container)
    }

    pub async fn stop(&self, reference: &str) -> Result<Container> {
        let container = self.get(reference).await?;
        self.runtime.stop(&container.name).await?;
        tracing::info!(container = %container.name, "Container stopped");
        Ok(container)
    }

    /// Stop, force-remove and deregister a container.
    pub async fn remove(&self, reference: &str) -> Result<Container> {
        let container = self.get(reference).await?;
        self.runtime.stop(&container.name).await?;
        self.runtime.remove(&container.name, true).await?;
        self.registry.delete_container(&container.name).await?;
        tracing::info!(container = %container.name, "Container removed");
        Ok(container)
    }

    pub async fn list(&self) -> Result<Vec<Container>> {
        self.registry.list_containers().await
    }

    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<Container>> {
        self.registry.list_containers_for_owner(owner).await
    }

    /// Remove every container of `owner`.
    ///
    /// Runtime failures are logged and the row is deregistered anyway, so a
    /// container that vanished from the runtime does not block teardown.
    /// Returns the number of rows removed.
    pub async fn remove_all_for_owner(&self, owner: &str) -> Result<usize> {
        let containers = self.registry.list_containers_for_owner(owner).await?;
        tracing::info!(owner, count = containers.len(), "Removing containers for owner");

        let mut removed = 0;
        for container in containers {
            if let Err(e) = self.runtime.stop(&container.name).await {
                tracing::warn!(container = %container.name, error = %e, "Failed to stop container");
            }
            if let Err(e) = self.runtime.remove(&container.name, true).await {
                tracing::warn!(container = %container.name, error = %e, "Failed to remove container");
            }
            match self.registry.delete_container(&container.name).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(container = %container.name, error = %e, "Failed to deregister container");
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::port::PortRange;
    use crate::sqlite::SqliteRegistry;
    use crate::testing::{contains_seed, FakeRuntime, FakeToolchain};

    struct Harness {
        provisioner: ContainerProvisioner,
        volumes: Arc<VolumeLifecycleManager>,
        registry: Arc<SqliteRegistry>,
        tools: Arc<FakeToolchain>,
        runtime: Arc<FakeRuntime>,
    }

    async fn harness_with(config: ProvisionerConfig) -> Harness {
        let registry = Arc::new(SqliteRegistry::in_memory().await.unwrap());
        let tools = Arc::new(FakeToolchain::new());
        let runtime = Arc::new(FakeRuntime::new());
        let volumes = Arc::new(VolumeLifecycleManager::new(
            registry.clone(),
            tools.clone(),
            runtime.clone(),
            VolumeConfig::default(),
        ));
        let provisioner = ContainerProvisioner::new(
            registry.clone(),
            volumes.clone(),
            tools.clone(),
            runtime.clone(),
            config,
        );
        Harness {
            provisioner,
            volumes,
            registry,
            tools,
            runtime,
        }
    }

    async fn harness() -> Harness {
        harness_with(ProvisionerConfig::default()).await
    }

    #[tokio::test]
    async fn test_create_mysql_container() {
        let h = harness().await;
        let volume = h.volumes.create("alice", 2048).await.unwrap();

        let c = h.provisioner.create("alice", "mysql").await.unwrap();
        assert!(c.name.starts_with("alice_mysql_"));
        assert_eq!(c.kind, EngineKind::Mysql);
        assert_eq!(c.root_login, "root");
        assert_eq!(c.volume, volume.name);
        assert!(c.data_path.starts_with(&volume.mount_path));
        assert!(h.tools.exists(&c.data_path).await);
        assert!(PortRange::default().contains(c.host_port));
        assert!(c.root_password.len() >= 10);
        assert!(contains_seed(&c.root_password, "alice"), "{}", c.root_password);

        let workload = h.runtime.workload(&c.name).unwrap();
        assert!(workload.running);
        assert_eq!(workload.id, c.id);
        assert_eq!(workload.spec.image, "mysql:8.0");
        assert_eq!(workload.spec.container_port, 3306);
        assert_eq!(workload.spec.host_port, c.host_port);
        assert_eq!(workload.spec.bind_target, "/var/lib/mysql");
        assert_eq!(
            workload.spec.env,
            vec![("MYSQL_ROOT_PASSWORD".to_string(), c.root_password.clone())]
        );

        let stored = h.registry.get_container(&c.name).await.unwrap().unwrap();
        assert_eq!(stored.host_port, c.host_port);
        assert_eq!(stored.root_password, c.root_password);
    }

    #[tokio::test]
    async fn test_create_postgres_kind_is_case_insensitive() {
        let h = harness().await;
        h.volumes.create("bob", 512).await.unwrap();
        let c = h.provisioner.create("bob", "PostgreS").await.unwrap();
        assert_eq!(c.kind, EngineKind::Postgres);
        let workload = h.runtime.workload(&c.name).unwrap();
        assert_eq!(workload.spec.image, "postgres:15");
        assert_eq!(workload.spec.bind_target, "/var/lib/postgresql/data");
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_kind() {
        let h = harness().await;
        h.volumes.create("alice", 512).await.unwrap();
        let err = h.provisioner.create("alice", "oracle").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(h.runtime.workload_count(), 0);
    }

    #[tokio::test]
    async fn test_create_uses_owners_first_volume() {
        let h = harness().await;
        let first = h.volumes.create("alice", 512).await.unwrap();
        h.volumes.create("alice", 512).await.unwrap();

        let c = h.provisioner.create("alice", "postgres").await.unwrap();
        let expected = h.volumes.first_for_owner("alice").await.unwrap().unwrap();
        assert_eq!(expected.name, first.name);
        assert_eq!(c.volume, first.name);
        assert!(c.data_path.starts_with(&first.mount_path));
    }

    #[tokio::test]
    async fn test_create_without_volume_is_rejected() {
        let h = harness().await;
        let err = h.provisioner.create("nobody", "mysql").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_runtime_failure_persists_nothing() {
        let h = harness().await;
        h.volumes.create("alice", 512).await.unwrap();
        h.runtime.fail_on("run");

        let err = h.provisioner.create("alice", "mysql").await.unwrap_err();
        assert!(matches!(err, CoreError::Provisioning(_)));
        assert!(h.provisioner.list().await.unwrap().is_empty());
        assert!(h.registry.used_ports().await.unwrap().is_empty());
        assert!(!h.tools.calls().is_empty());
        assert_eq!(h.tools.calls().last(), Some(&"remove_dir"));
    }

    #[tokio::test]
    async fn test_ports_are_distinct() {
        let h = harness_with(ProvisionerConfig {
            port_range: PortRange::new(41000, 41007).unwrap(),
            ..Default::default()
        })
        .await;
        h.volumes.create("alice", 512).await.unwrap();

        let mut ports = std::collections::HashSet::new();
        for _ in 0..8 {
            let c = h.provisioner.create("alice", "mysql").await.unwrap();
            assert!(ports.insert(c.host_port));
        }
        // Range exhausted
        let err = h.provisioner.create("alice", "mysql").await.unwrap_err();
        assert!(matches!(err, CoreError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_stop_start_remove_by_name_or_id() {
        let h = harness().await;
        h.volumes.create("alice", 512).await.unwrap();
        let c = h.provisioner.create("alice", "mysql").await.unwrap();

        h.provisioner.stop(&c.id).await.unwrap();
        assert!(!h.runtime.workload(&c.name).unwrap().running);
        h.provisioner.start(&c.name).await.unwrap();
        assert!(h.runtime.workload(&c.name).unwrap().running);

        let removed = h.provisioner.remove(&c.name).await.unwrap();
        assert_eq!(removed.name, c.name);
        assert!(h.runtime.workload(&c.name).is_none());
        assert!(h.provisioner.list().await.unwrap().is_empty());

        assert!(matches!(
            h.provisioner.remove(&c.name).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_reference() {
        let h = harness().await;
        assert!(matches!(
            h.provisioner.start("ghost").await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            h.provisioner.stop("ghost").await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_all_for_owner_deregisters_despite_runtime_errors() {
        let h = harness().await;
        h.volumes.create("alice", 512).await.unwrap();
        h.volumes.create("bob", 512).await.unwrap();
        h.provisioner.create("alice", "mysql").await.unwrap();
        h.provisioner.create("alice", "postgres").await.unwrap();
        let keep = h.provisioner.create("bob", "mysql").await.unwrap();
        h.runtime.fail_on("remove");

        assert_eq!(h.provisioner.remove_all_for_owner("alice").await.unwrap(), 2);
        assert!(h.provisioner.list_for_owner("alice").await.unwrap().is_empty());
        let left: Vec<String> = h
            .provisioner
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(left, vec![keep.name]);
    }
}
