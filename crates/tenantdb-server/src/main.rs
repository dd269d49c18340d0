//! tenantdb server entry point.
//!
//! Connects the registry, filesystem toolchain and Docker runtime, repairs
//! volumes left mid-operation by a previous run, and serves the HTTP API
//! until Ctrl-C.

use std::sync::Arc;
use tenantdb_core::{
    ContainerProvisioner, DockerRuntime, HostToolchain, SqliteRegistry, TenantService,
    VolumeLifecycleManager,
};
use tenantdb_server::{http, AppState, ServerConfig};
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("tenantdb_server=info".parse()?)
                .add_directive("tenantdb_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tenantdb server");

    // Load configuration from environment
    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate()?;
    config.validate_warn();

    let registry = Arc::new(SqliteRegistry::connect(&config.database_url).await?);
    let tools = Arc::new(HostToolchain::new(config.tool_timeout));
    let runtime = Arc::new(DockerRuntime::connect(config.runtime_timeout).await?);

    let volume_config = config.volume_config();
    volume_config.validate()?;
    let volumes = Arc::new(VolumeLifecycleManager::new(
        registry.clone(),
        tools.clone(),
        runtime.clone(),
        volume_config,
    ));
    let containers = Arc::new(ContainerProvisioner::new(
        registry.clone(),
        volumes.clone(),
        tools,
        runtime,
        config.provisioner_config()?,
    ));
    let tenants = Arc::new(TenantService::new(
        registry.clone(),
        volumes.clone(),
        containers.clone(),
        config.tenant_config(),
    ));

    if config.recover_on_start {
        match volumes.recover_interrupted().await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::info!(count = recovered.len(), ?recovered, "Recovered volumes");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Volume recovery failed"),
        }
    }

    let state = AppState {
        tenants,
        volumes,
        containers,
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let http_addr = config.http_addr;
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = http::serve(state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });
    tracing::info!(addr = %http_addr, "Server ready");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, shutting down...");

    let _ = shutdown_tx.send(());
    let _ = http_handle.await;

    registry.close().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}
