//! # tenantdb-server
//!
//! HTTP server exposing tenantdb's tenant, volume and container operations.
//!
//! ## Quick Start
//!
//! Run the server with default configuration (needs root and a Docker
//! daemon):
//!
//! ```bash
//! cargo run -p tenantdb-server
//! ```
//!
//! Configure via environment variables:
//!
//! ```bash
//! export TENANTDB_DATABASE_URL=sqlite:///var/lib/tenantdb/registry.db?mode=rwc
//! export TENANTDB_IMAGES_DIR=/var/lib/docker-imgs
//! export TENANTDB_MOUNT_ROOT=/mnt
//! export TENANTDB_HTTP_PORT=8080
//! cargo run -p tenantdb-server
//! ```
//!
//! ## Error Responses
//!
//! | Error | Status |
//! |-------|--------|
//! | validation | 400 |
//! | not found | 404 |
//! | duplicate | 409 |
//! | provisioning (tools, container runtime) | 502 |
//! | registry | 500 |
//!
//! Bodies are `{"error": "<message>"}`.

mod config;
mod error;
pub mod http;
mod types;

pub use config::{ConfigError, ServerConfig};
pub use error::{ApiError, ApiResult};
pub use http::{build_router, serve, AppState};
pub use types::*;
