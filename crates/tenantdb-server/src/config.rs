//! Configuration for the tenantdb server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tenantdb_core::{PortRange, ProvisionerConfig, TenantConfig, VolumeConfig};

/// Configuration for the tenantdb server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite registry URL.
    pub database_url: String,

    /// Directory holding volume image files.
    pub images_dir: PathBuf,

    /// Directory under which volumes are mounted.
    pub mount_root: PathBuf,

    /// Lowest host port handed to containers (default: 30000).
    pub port_min: u16,

    /// Highest host port handed to containers (default: 60000).
    pub port_max: u16,

    /// Timeout for each filesystem tool invocation (default: 300s).
    pub tool_timeout: Duration,

    /// Timeout for each container runtime call (default: 120s).
    pub runtime_timeout: Duration,

    /// Quota for users created without one (default: 1024 MB).
    pub default_quota_mb: u64,

    /// Repair interrupted volumes at startup (default: true).
    pub recover_on_start: bool,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("{name} must be an absolute path: {path}")]
    RelativePath { name: &'static str, path: PathBuf },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("unsupported database url (expected sqlite:): {0}")]
    UnsupportedDatabase(String),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://tenantdb.db?mode=rwc".to_string(),
            images_dir: PathBuf::from("/var/lib/docker-imgs"),
            mount_root: PathBuf::from("/mnt"),
            port_min: 30000,
            port_max: 60000,
            tool_timeout: Duration::from_secs(300),
            runtime_timeout: Duration::from_secs(120),
            default_quota_mb: 1024,
            recover_on_start: true,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TENANTDB_DATABASE_URL` | `sqlite://tenantdb.db?mode=rwc` |
    /// | `TENANTDB_IMAGES_DIR` | `/var/lib/docker-imgs` |
    /// | `TENANTDB_MOUNT_ROOT` | `/mnt` |
    /// | `TENANTDB_PORT_MIN` | `30000` |
    /// | `TENANTDB_PORT_MAX` | `60000` |
    /// | `TENANTDB_TOOL_TIMEOUT_SECS` | `300` |
    /// | `TENANTDB_RUNTIME_TIMEOUT_SECS` | `120` |
    /// | `TENANTDB_DEFAULT_QUOTA_MB` | `1024` |
    /// | `TENANTDB_RECOVER_ON_START` | `true` |
    /// | `TENANTDB_HTTP_HOST` | `0.0.0.0` |
    /// | `TENANTDB_HTTP_PORT` | `8080` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr =
            env_parse("TENANTDB_HTTP_HOST").unwrap_or(default.http_addr.ip());
        let http_port: u16 = env_parse("TENANTDB_HTTP_PORT").unwrap_or(default.http_addr.port());

        Self {
            database_url: std::env::var("TENANTDB_DATABASE_URL").unwrap_or(default.database_url),
            images_dir: std::env::var("TENANTDB_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.images_dir),
            mount_root: std::env::var("TENANTDB_MOUNT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.mount_root),
            port_min: env_parse("TENANTDB_PORT_MIN").unwrap_or(default.port_min),
            port_max: env_parse("TENANTDB_PORT_MAX").unwrap_or(default.port_max),
            tool_timeout: env_parse("TENANTDB_TOOL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.tool_timeout),
            runtime_timeout: env_parse("TENANTDB_RUNTIME_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.runtime_timeout),
            default_quota_mb: env_parse("TENANTDB_DEFAULT_QUOTA_MB")
                .unwrap_or(default.default_quota_mb),
            recover_on_start: std::env::var("TENANTDB_RECOVER_ON_START")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.recover_on_start),
            http_addr: SocketAddr::new(http_host, http_port),
        }
    }

    /// Validate the configuration.
    ///
    /// Call this at startup to get clear error messages about bad settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.database_url.starts_with("sqlite:") {
            return Err(ConfigError::UnsupportedDatabase(self.database_url.clone()));
        }

        if !self.images_dir.is_absolute() {
            return Err(ConfigError::RelativePath {
                name: "TENANTDB_IMAGES_DIR",
                path: self.images_dir.clone(),
            });
        }

        if !self.mount_root.is_absolute() {
            return Err(ConfigError::RelativePath {
                name: "TENANTDB_MOUNT_ROOT",
                path: self.mount_root.clone(),
            });
        }

        self.port_range()?;

        if self.tool_timeout.is_zero() {
            return Err(ConfigError::Zero("TENANTDB_TOOL_TIMEOUT_SECS"));
        }
        if self.runtime_timeout.is_zero() {
            return Err(ConfigError::Zero("TENANTDB_RUNTIME_TIMEOUT_SECS"));
        }
        if self.default_quota_mb == 0 {
            return Err(ConfigError::Zero("TENANTDB_DEFAULT_QUOTA_MB"));
        }

        Ok(())
    }

    /// Log warnings for settings that work but are likely unintended.
    pub fn validate_warn(&self) {
        if !self.images_dir.exists() {
            tracing::warn!("Images directory not found (created on demand): {:?}", self.images_dir);
        }

        if !self.mount_root.exists() {
            tracing::warn!("Mount root not found: {:?}", self.mount_root);
        }

        if self.port_min < 1024 {
            tracing::warn!(port_min = self.port_min, "Port range includes privileged ports");
        }

        if !self.recover_on_start {
            tracing::warn!("Startup recovery disabled; interrupted volumes stay degraded");
        }
    }

    fn port_range(&self) -> Result<PortRange, ConfigError> {
        PortRange::new(self.port_min, self.port_max).map_err(|_| ConfigError::InvalidPortRange {
            min: self.port_min,
            max: self.port_max,
        })
    }

    pub fn volume_config(&self) -> VolumeConfig {
        VolumeConfig {
            images_dir: self.images_dir.clone(),
            mount_root: self.mount_root.clone(),
        }
    }

    pub fn provisioner_config(&self) -> Result<ProvisionerConfig, ConfigError> {
        Ok(ProvisionerConfig {
            port_range: self.port_range()?,
            ..Default::default()
        })
    }

    pub fn tenant_config(&self) -> TenantConfig {
        TenantConfig {
            default_quota_mb: self.default_quota_mb,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.database_url, "sqlite://tenantdb.db?mode=rwc");
        assert_eq!(config.images_dir, PathBuf::from("/var/lib/docker-imgs"));
        assert_eq!(config.mount_root, PathBuf::from("/mnt"));
        assert_eq!((config.port_min, config.port_max), (30000, 60000));
        assert_eq!(config.tool_timeout, Duration::from_secs(300));
        assert_eq!(config.runtime_timeout, Duration::from_secs(120));
        assert_eq!(config.default_quota_mb, 1024);
        assert!(config.recover_on_start);
        assert_eq!(config.http_addr.port(), 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let config = ServerConfig {
            port_min: 50000,
            port_max: 40000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange { .. })
        ));

        let config = ServerConfig {
            mount_root: PathBuf::from("mnt"),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativePath { .. })
        ));

        let config = ServerConfig {
            default_quota_mb: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));

        let config = ServerConfig {
            database_url: "postgres://localhost/x".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedDatabase(_))
        ));
    }

    #[test]
    fn test_component_configs() {
        let config = ServerConfig {
            port_min: 40000,
            port_max: 40100,
            default_quota_mb: 256,
            ..Default::default()
        };
        let provisioner = config.provisioner_config().unwrap();
        assert_eq!(provisioner.port_range, PortRange::new(40000, 40100).unwrap());
        assert_eq!(config.tenant_config().default_quota_mb, 256);
        assert_eq!(config.volume_config().mount_root, PathBuf::from("/mnt"));
    }

    #[test]
    fn test_from_env_uses_defaults() {
        // Clear any existing env vars
        for var in [
            "TENANTDB_DATABASE_URL",
            "TENANTDB_IMAGES_DIR",
            "TENANTDB_MOUNT_ROOT",
            "TENANTDB_PORT_MIN",
            "TENANTDB_PORT_MAX",
            "TENANTDB_DEFAULT_QUOTA_MB",
            "TENANTDB_RECOVER_ON_START",
            "TENANTDB_HTTP_HOST",
            "TENANTDB_HTTP_PORT",
        ] {
            std::env::remove_var(var);
        }

        let config = ServerConfig::from_env();
        let default = ServerConfig::default();

        assert_eq!(config.database_url, default.database_url);
        assert_eq!(config.images_dir, default.images_dir);
        assert_eq!(config.port_min, default.port_min);
        assert_eq!(config.default_quota_mb, default.default_quota_mb);
        assert_eq!(config.http_addr, default.http_addr);
    }
}
