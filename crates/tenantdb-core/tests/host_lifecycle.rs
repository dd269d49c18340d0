//! Integration tests for tenantdb-core against the real host.
//!
//! These tests require:
//! - Linux, run as root (loop mounts)
//! - e2fsprogs and util-linux (`mkfs.ext4`, `e2fsck`, `resize2fs`, `fallocate`)
//! - A running Docker daemon
//!
//! Run with: `cargo test -p tenantdb-core -- --ignored`

use std::sync::Arc;
use std::time::Duration;
use tenantdb_core::{
    ContainerProvisioner, DockerRuntime, HostToolchain, NewUser, ProvisionerConfig,
    SqliteRegistry, TenantConfig, TenantService, VolumeConfig, VolumeLifecycleManager,
    VolumeStatus,
};

struct Stack {
    tenants: TenantService,
    volumes: Arc<VolumeLifecycleManager>,
    containers: Arc<ContainerProvisioner>,
}

async fn stack(scratch: &std::path::Path) -> Stack {
    let registry = Arc::new(SqliteRegistry::in_memory().await.expect("registry"));
    let tools = Arc::new(HostToolchain::new(Duration::from_secs(120)));
    let runtime = Arc::new(
        DockerRuntime::connect(Duration::from_secs(300))
            .await
            .expect("Docker daemon not reachable"),
    );
    let config = VolumeConfig::builder()
        .images_dir(scratch.join("images"))
        .mount_root(scratch.join("mnt"))
        .build()
        .expect("volume config");

    let volumes = Arc::new(VolumeLifecycleManager::new(
        registry.clone(),
        tools.clone(),
        runtime.clone(),
        config,
    ));
    let containers = Arc::new(ContainerProvisioner::new(
        registry.clone(),
        volumes.clone(),
        tools,
        runtime,
        ProvisionerConfig::default(),
    ));
    let tenants = TenantService::new(
        registry,
        volumes.clone(),
        containers.clone(),
        TenantConfig::default(),
    );
    Stack {
        tenants,
        volumes,
        containers,
    }
}

/// Per-test scratch directory; tests run in parallel and must not share mounts.
fn scratch_dir(test: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("tenantdb-it-{}-{test}", std::process::id()))
}

/// Test volume lifecycle: create -> grow -> shrink -> delete
#[tokio::test]
#[ignore = "requires root + loop devices + Docker"]
async fn test_volume_resize_cycle() {
    let scratch = scratch_dir("resize");
    let s = stack(&scratch).await;

    let (_, volume) = s
        .tenants
        .create_user(NewUser::new("it_resize").quota_mb(64))
        .await
        .expect("Failed to create user");
    assert_eq!(volume.status, VolumeStatus::Ready);

    let usage = s.volumes.usage(&volume.name).await.expect("usage");
    assert!(usage.used_mb <= usage.total_mb);

    let grown = s.volumes.grow(&volume.name, 32).await.expect("grow");
    assert_eq!(grown.capacity_mb, 96);
    let shrunk = s.volumes.shrink(&volume.name, 32).await.expect("shrink");
    assert_eq!(shrunk.capacity_mb, 64);

    s.tenants
        .delete_user("it_resize")
        .await
        .expect("Failed to delete user");
    assert!(!volume.image_path.exists());
    let _ = std::fs::remove_dir_all(&scratch);
}

/// Test the full tenant flow with a MySQL container
#[tokio::test]
#[ignore = "requires root + loop devices + Docker"]
async fn test_tenant_with_mysql() {
    let scratch = scratch_dir("mysql");
    let s = stack(&scratch).await;

    s.tenants
        .create_user(NewUser::new("it_alice").quota_mb(2048))
        .await
        .expect("Failed to create user");

    let db = s
        .containers
        .create("it_alice", "mysql")
        .await
        .expect("Failed to create container");
    assert!(db.data_path.exists());

    s.containers.stop(&db.name).await.expect("stop");
    // Stopping twice is tolerated by the runtime
    s.containers.stop(&db.name).await.expect("second stop");
    s.containers.start(&db.id).await.expect("start");

    s.tenants
        .delete_user("it_alice")
        .await
        .expect("Failed to delete user");
    assert!(s.containers.list().await.expect("list").is_empty());
    let _ = std::fs::remove_dir_all(&scratch);
}
