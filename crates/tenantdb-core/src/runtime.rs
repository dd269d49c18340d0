//! Container runtime interface and its Docker Engine implementation.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, PortBinding};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to launch one detached database workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<(String, String)>,
    /// Port inside the container (TCP).
    pub container_port: u16,
    pub host_port: u16,
    /// Host directory bound read-write to `bind_target`.
    pub bind_source: PathBuf,
    pub bind_target: String,
}

/// Identity of a launched workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub id: String,
    pub name: String,
}

/// Launches and controls isolated workloads and their storage endpoints.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a detached workload.
    async fn run(&self, spec: &LaunchSpec) -> Result<RuntimeHandle>;
    async fn start(&self, name: &str) -> Result<()>;
    /// Stop a workload; stopping an already stopped workload succeeds.
    async fn stop(&self, name: &str) -> Result<()>;
    async fn remove(&self, name: &str, force: bool) -> Result<()>;
    /// Register a named storage endpoint bound to a host mount path.
    async fn create_storage_endpoint(&self, name: &str, mount_path: &std::path::Path)
        -> Result<()>;
    async fn remove_storage_endpoint(&self, name: &str) -> Result<()>;
}

/// Seconds the engine waits for a graceful stop before killing.
const STOP_GRACE_SECS: i64 = 10;

/// Runtime backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    timeout: Duration,
}

impl DockerRuntime {
    /// Connect with local defaults (unix socket or `DOCKER_HOST`) and verify
    /// the daemon answers.
    pub async fn connect(timeout: Duration) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let runtime = Self { docker, timeout };
        runtime.bounded("ping", runtime.docker.ping()).await?;
        tracing::info!("Connected to Docker daemon");
        Ok(runtime)
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, DockerError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(CoreError::from),
            Err(_) => Err(CoreError::Provisioning(format!(
                "container runtime {what} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Whether `image` is present locally.
    async fn has_image(&self, image: &str) -> Result<bool> {
        let lookup = tokio::time::timeout(self.timeout, self.docker.inspect_image(image)).await;
        match lookup {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) if status_code(&e) == Some(404) => Ok(false),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CoreError::Provisioning(format!(
                "container runtime image inspect timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Pull `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.has_image(image).await? {
            return Ok(());
        }
        tracing::info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        self.bounded(
            "image pull",
            self.docker
                .create_image(Some(options), None, None)
                .try_collect::<Vec<_>>(),
        )
        .await?;
        Ok(())
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<RuntimeHandle> {
        self.ensure_image(&spec.image).await?;

        let port_key = format!("{}/tcp", spec.container_port);
        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);
        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.bind_source.display(),
                spec.bind_target
            )]),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .bounded("create", self.docker.create_container(Some(options), config))
            .await?;
        tracing::debug!(container = %spec.name, id = %created.id, "Created container");

        if let Err(e) = self
            .bounded(
                "start",
                self.docker
                    .start_container(&created.id, None::<StartContainerOptions<String>>),
            )
            .await
        {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(rm) = self
                .bounded("remove", self.docker.remove_container(&created.id, Some(options)))
                .await
            {
                tracing::warn!(container = %spec.name, error = %rm, "Failed to remove container that did not start");
            }
            return Err(e);
        }

        Ok(RuntimeHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        let result = tokio::time::timeout(
            self.timeout,
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>),
        )
        .await
        .map_err(|_| CoreError::Provisioning(format!("start of {name} timed out")))?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Err(CoreError::Provisioning(format!(
                "container {name} does not exist in the runtime"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        let result = tokio::time::timeout(
            self.timeout,
            self.docker.stop_container(name, Some(options)),
        )
        .await
        .map_err(|_| CoreError::Provisioning(format!("stop of {name} timed out")))?;
        match result {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.bounded("remove", self.docker.remove_container(name, Some(options)))
            .await
    }

    async fn create_storage_endpoint(
        &self,
        name: &str,
        mount_path: &std::path::Path,
    ) -> Result<()> {
        let device = mount_path.to_string_lossy().into_owned();
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            driver_opts: HashMap::from([
                ("type".to_string(), "none".to_string()),
                ("device".to_string(), device),
                ("o".to_string(), "bind".to_string()),
            ]),
            ..Default::default()
        };
        self.bounded("volume create", self.docker.create_volume(options))
            .await?;
        Ok(())
    }

    async fn remove_storage_endpoint(&self, name: &str) -> Result<()> {
        self.bounded(
            "volume remove",
            self.docker
                .remove_volume(name, Some(RemoveVolumeOptions { force: true })),
        )
        .await
    }
}
