//! SQLite-backed [`Registry`].

use crate::error::{CoreError, EntityKind, Result};
use crate::models::{Container, User, Volume, VolumeStatus};
use crate::registry::Registry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        username    TEXT PRIMARY KEY,
        tier        TEXT NOT NULL,
        quota_mb    INTEGER NOT NULL,
        created_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS volumes (
        name        TEXT PRIMARY KEY,
        owner       TEXT NOT NULL,
        mount_path  TEXT NOT NULL,
        capacity_mb INTEGER NOT NULL,
        image_path  TEXT NOT NULL,
        status      TEXT NOT NULL,
        created_at  TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS volumes_owner ON volumes(owner)",
    "CREATE TABLE IF NOT EXISTS containers (
        name          TEXT PRIMARY KEY,
        runtime_id    TEXT NOT NULL,
        owner         TEXT NOT NULL,
        kind          TEXT NOT NULL,
        root_login    TEXT NOT NULL,
        root_password TEXT NOT NULL,
        host_port     INTEGER NOT NULL UNIQUE,
        volume        TEXT NOT NULL,
        data_path     TEXT NOT NULL,
        created_at    TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS containers_owner ON containers(owner)",
];

const VOLUME_COLUMNS: &str = "name, owner, mount_path, capacity_mb, image_path, status, created_at";
const CONTAINER_COLUMNS: &str = "name, runtime_id, owner, kind, root_login, root_password, \
     host_port, volume, data_path, created_at";

/// Registry stored in a SQLite database through a sqlx pool.
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Connect to `url` (e.g. `sqlite://tenantdb.db?mode=rwc`) and create the
    /// schema if missing.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(CoreError::Registry)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(CoreError::Registry)?;
        tracing::info!(url = %url, "Connected to registry");
        Self::with_pool(pool).await
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// The pool is pinned to a single connection that never expires, since
    /// each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(CoreError::Registry)?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(CoreError::Registry)?;
        }
        Ok(Self { pool })
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map a write error, turning unique violations into `Duplicate`.
fn write_err(err: sqlx::Error, what: impl FnOnce() -> String) -> CoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::Duplicate(what()),
        _ => CoreError::Registry(err),
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| CoreError::Validation(format!("value {value} out of range")))
}

#[derive(FromRow)]
struct UserRow {
    username: String,
    tier: String,
    quota_mb: i64,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            username: row.username,
            tier: row.tier,
            quota_mb: row.quota_mb.max(0) as u64,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct VolumeRow {
    name: String,
    owner: String,
    mount_path: String,
    capacity_mb: i64,
    image_path: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<VolumeRow> for Volume {
    type Error = CoreError;

    fn try_from(row: VolumeRow) -> Result<Self> {
        Ok(Self {
            status: row.status.parse::<VolumeStatus>()?,
            name: row.name,
            owner: row.owner,
            mount_path: PathBuf::from(row.mount_path),
            capacity_mb: row.capacity_mb.max(0) as u64,
            image_path: PathBuf::from(row.image_path),
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct ContainerRow {
    name: String,
    runtime_id: String,
    owner: String,
    kind: String,
    root_login: String,
    root_password: String,
    host_port: i64,
    volume: String,
    data_path: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ContainerRow> for Container {
    type Error = CoreError;

    fn try_from(row: ContainerRow) -> Result<Self> {
        let host_port = u16::try_from(row.host_port).map_err(|_| {
            CoreError::Validation(format!("stored port {} out of range", row.host_port))
        })?;
        Ok(Self {
            id: row.runtime_id,
            kind: row.kind.parse()?,
            name: row.name,
            owner: row.owner,
            root_login: row.root_login,
            root_password: row.root_password,
            host_port,
            volume: row.volume,
            data_path: PathBuf::from(row.data_path),
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (username, tier, quota_mb, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&user.username)
        .bind(&user.tier)
        .bind(to_i64(user.quota_mb)?)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, || format!("user '{}'", user.username)))?;
        Ok(())
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT username, tier, quota_mb, created_at FROM users WHERE username = ?1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoreError::Registry)?;
        Ok(row.map(User::from))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT username, tier, quota_mb, created_at FROM users ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::Registry)?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?1")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_volume(&self, volume: &Volume) -> Result<()> {
        sqlx::query(
            "INSERT INTO volumes (name, owner, mount_path, capacity_mb, image_path, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&volume.name)
        .bind(&volume.owner)
        .bind(volume.mount_path.to_string_lossy().into_owned())
        .bind(to_i64(volume.capacity_mb)?)
        .bind(volume.image_path.to_string_lossy().into_owned())
        .bind(volume.status.as_str())
        .bind(volume.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, || format!("volume '{}'", volume.name)))?;
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<Volume>> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE name = ?1");
        let row = sqlx::query_as::<_, VolumeRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        row.map(Volume::try_from).transpose()
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes ORDER BY created_at, rowid");
        let rows = sqlx::query_as::<_, VolumeRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        rows.into_iter().map(Volume::try_from).collect()
    }

    async fn list_volumes_for_owner(&self, owner: &str) -> Result<Vec<Volume>> {
        let sql = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes WHERE owner = ?1 ORDER BY created_at, rowid"
        );
        let rows = sqlx::query_as::<_, VolumeRow>(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        rows.into_iter().map(Volume::try_from).collect()
    }

    async fn update_volume_capacity(&self, name: &str, capacity_mb: u64) -> Result<()> {
        let result = sqlx::query("UPDATE volumes SET capacity_mb = ?1 WHERE name = ?2")
            .bind(to_i64(capacity_mb)?)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(EntityKind::Volume, name));
        }
        Ok(())
    }

    async fn set_volume_status(&self, name: &str, status: VolumeStatus) -> Result<()> {
        let result = sqlx::query("UPDATE volumes SET status = ?1 WHERE name = ?2")
            .bind(status.as_str())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(EntityKind::Volume, name));
        }
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM volumes WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_container(&self, container: &Container) -> Result<()> {
        sqlx::query(
            "INSERT INTO containers (name, runtime_id, owner, kind, root_login, root_password,
                                     host_port, volume, data_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&container.name)
        .bind(&container.id)
        .bind(&container.owner)
        .bind(container.kind.as_str())
        .bind(&container.root_login)
        .bind(&container.root_password)
        .bind(i64::from(container.host_port))
        .bind(&container.volume)
        .bind(container.data_path.to_string_lossy().into_owned())
        .bind(container.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            write_err(e, || {
                format!(
                    "container '{}' or host port {}",
                    container.name, container.host_port
                )
            })
        })?;
        Ok(())
    }

    async fn get_container(&self, reference: &str) -> Result<Option<Container>> {
        let sql = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE name = ?1 OR runtime_id = ?1 LIMIT 1"
        );
        let row = sqlx::query_as::<_, ContainerRow>(&sql)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        row.map(Container::try_from).transpose()
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers ORDER BY created_at, rowid");
        let rows = sqlx::query_as::<_, ContainerRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        rows.into_iter().map(Container::try_from).collect()
    }

    async fn list_containers_for_owner(&self, owner: &str) -> Result<Vec<Container>> {
        let sql = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE owner = ?1 ORDER BY created_at, rowid"
        );
        let rows = sqlx::query_as::<_, ContainerRow>(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        rows.into_iter().map(Container::try_from).collect()
    }

    async fn delete_container(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM containers WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        Ok(result.rows_affected() > 0)
    }

    async fn used_ports(&self) -> Result<HashSet<u16>> {
        let ports: Vec<i64> = sqlx::query_scalar("SELECT host_port FROM containers")
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::Registry)?;
        Ok(ports
            .into_iter()
            .filter_map(|p| u16::try_from(p).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngineKind;

    fn user(name: &str) -> User {
        User {
            username: name.into(),
            tier: "user".into(),
            quota_mb: 1024,
            created_at: Utc::now(),
        }
    }

    fn volume(name: &str, owner: &str) -> Volume {
        Volume {
            name: name.into(),
            owner: owner.into(),
            mount_path: PathBuf::from(format!("/mnt/{name}")),
            capacity_mb: 512,
            image_path: PathBuf::from(format!("/var/lib/docker-imgs/{name}.img")),
            status: VolumeStatus::Ready,
            created_at: Utc::now(),
        }
    }

    fn container(name: &str, owner: &str, port: u16) -> Container {
        Container {
            id: format!("id-{name}"),
            name: name.into(),
            owner: owner.into(),
            kind: EngineKind::Postgres,
            root_login: "root".into(),
            root_password: "secret".into(),
            host_port: port,
            volume: "vol".into(),
            data_path: PathBuf::from("/mnt/vol/postgres_1"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_crud_and_duplicate() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry.insert_user(&user("alice")).await.unwrap();

        let err = registry.insert_user(&user("alice")).await.unwrap_err();
        assert!(matches!(err, CoreError::Duplicate(_)));

        let fetched = registry.get_user("alice").await.unwrap().unwrap();
        assert_eq!(fetched.quota_mb, 1024);
        assert_eq!(registry.list_users().await.unwrap().len(), 1);

        assert!(registry.delete_user("alice").await.unwrap());
        assert!(!registry.delete_user("alice").await.unwrap());
        assert!(registry.get_user("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_volume_updates() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry.insert_volume(&volume("v1", "alice")).await.unwrap();
        registry.insert_volume(&volume("v2", "bob")).await.unwrap();

        registry.update_volume_capacity("v1", 2048).await.unwrap();
        registry
            .set_volume_status("v1", VolumeStatus::Degraded)
            .await
            .unwrap();
        let v1 = registry.get_volume("v1").await.unwrap().unwrap();
        assert_eq!(v1.capacity_mb, 2048);
        assert_eq!(v1.status, VolumeStatus::Degraded);

        let owned = registry.list_volumes_for_owner("alice").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "v1");

        let err = registry.update_volume_capacity("nope", 1).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_container_port_uniqueness() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry
            .insert_container(&container("c1", "alice", 31000))
            .await
            .unwrap();
        let err = registry
            .insert_container(&container("c2", "alice", 31000))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Duplicate(_)));

        registry
            .insert_container(&container("c2", "bob", 31001))
            .await
            .unwrap();
        let ports = registry.used_ports().await.unwrap();
        assert_eq!(ports, HashSet::from([31000, 31001]));
    }

    #[tokio::test]
    async fn test_container_lookup_by_name_or_id() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry
            .insert_container(&container("c1", "alice", 40000))
            .await
            .unwrap();

        let by_name = registry.get_container("c1").await.unwrap().unwrap();
        let by_id = registry.get_container("id-c1").await.unwrap().unwrap();
        assert_eq!(by_name, by_id);
        assert_eq!(by_name.kind, EngineKind::Postgres);

        assert!(registry.delete_container("c1").await.unwrap());
        assert!(registry.list_containers().await.unwrap().is_empty());
    }
}
