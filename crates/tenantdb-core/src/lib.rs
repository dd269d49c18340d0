//! # tenantdb-core
//!
//! Per-tenant database provisioning on a single host.
//!
//! Each tenant (user) owns a capacity-bounded volume backed by a loopback
//! filesystem image, and any number of database containers whose data lives
//! in subdirectories of that volume.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    tenantdb-core (host)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐                                     │
//! │  │  TenantService  │  create_user / delete_user          │
//! │  └─────────────────┘                                     │
//! │       │        │                                         │
//! │       ▼        ▼                                         │
//! │  ┌──────────┐ ┌──────────────────────┐                   │
//! │  │ Volume   │ │ ContainerProvisioner │                   │
//! │  │ Lifecycle│ │  - PortAllocator     │                   │
//! │  │ Manager  │ │  - CredentialGen.    │                   │
//! │  └──────────┘ └──────────────────────┘                   │
//! │     │    │        │            │                         │
//! │     ▼    └────────┼──────┐     ▼                         │
//! │  ┌───────────┐    │   ┌──────────────────┐               │
//! │  │ Toolchain │◀───┘   │ ContainerRuntime │               │
//! │  │ (fallocate│        │ (Docker Engine)  │               │
//! │  │  mount ..)│        └──────────────────┘               │
//! │  └───────────┘                                           │
//! │        all three record state in the Registry (SQLite)   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tenantdb_core::{
//!     ContainerProvisioner, DockerRuntime, HostToolchain, NewUser, ProvisionerConfig,
//!     SqliteRegistry, TenantConfig, TenantService, VolumeConfig, VolumeLifecycleManager,
//! };
//!
//! # async fn example() -> tenantdb_core::Result<()> {
//! let registry = Arc::new(SqliteRegistry::connect("sqlite://tenantdb.db?mode=rwc").await?);
//! let tools = Arc::new(HostToolchain::default());
//! let runtime = Arc::new(DockerRuntime::connect(Duration::from_secs(120)).await?);
//!
//! let volumes = Arc::new(VolumeLifecycleManager::new(
//!     registry.clone(), tools.clone(), runtime.clone(), VolumeConfig::default(),
//! ));
//! let containers = Arc::new(ContainerProvisioner::new(
//!     registry.clone(), volumes.clone(), tools, runtime, ProvisionerConfig::default(),
//! ));
//! let tenants = TenantService::new(registry, volumes.clone(), containers.clone(), TenantConfig::default());
//!
//! let (_user, volume) = tenants.create_user(NewUser::new("alice").quota_mb(2048)).await?;
//! let db = containers.create("alice", "mysql").await?;
//! println!("mysql for alice on port {} ({})", db.host_port, volume.name);
//!
//! volumes.grow(&volume.name, 512).await?;
//! tenants.delete_user("alice").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Volume Lifecycle**: Create, grow, shrink, measure and tear down loopback volumes
//! - **Crash Visibility**: Persisted volume status with startup recovery
//! - **Container Provisioning**: MySQL and PostgreSQL containers with unique ports and credentials
//! - **Tenant Teardown**: Best-effort removal of everything a user owns

mod config;
mod credential;
mod error;
mod models;
mod port;
mod provisioner;
mod registry;
mod runtime;
mod sqlite;
mod tenant;
mod toolchain;
mod volume;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ProvisionerConfig, TenantConfig, VolumeConfig, VolumeConfigBuilder};
pub use credential::CredentialGenerator;
pub use error::{CoreError, EntityKind, Result, ToolError};
pub use models::{Container, EngineKind, User, Volume, VolumeStatus, VolumeUsage};
pub use port::{PortAllocator, PortRange};
pub use provisioner::ContainerProvisioner;
pub use registry::Registry;
pub use runtime::{ContainerRuntime, DockerRuntime, LaunchSpec, RuntimeHandle};
pub use sqlite::SqliteRegistry;
pub use tenant::{NewUser, TenantService};
pub use toolchain::{parse_df_output, FsUsage, HostToolchain, Toolchain};
pub use volume::{UsageReport, VolumeLifecycleManager};
