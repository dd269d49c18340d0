//! HTTP API over the tenant, volume and container services.
//!
//! ## Endpoints
//!
//! - `GET /` - Server info and route list
//! - `GET /health` - Health check
//! - `POST /users`, `GET /users`, `DELETE /users/:username`
//! - `GET /volumes`, `GET /volumes/usage`, `GET /volumes/:name/usage`
//! - `POST /volumes/:name/grow`, `POST /volumes/:name/shrink`
//! - `POST /containers`, `GET /containers`
//! - `POST /containers/:reference/start`, `POST /containers/:reference/stop`,
//!   `DELETE /containers/:reference`
//!
//! Container references are names or runtime ids.

use crate::error::ApiResult;
use crate::types::{
    ContainerActionResult, CreateContainerParams, CreateUserResult, DeleteUserResult, GrowParams,
    ShrinkParams,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tenantdb_core::{
    Container, ContainerProvisioner, NewUser, TenantService, UsageReport, User, Volume,
    VolumeLifecycleManager, VolumeUsage,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Services shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantService>,
    pub volumes: Arc<VolumeLifecycleManager>,
    pub containers: Arc<ContainerProvisioner>,
}

const ROUTES: &[(&str, &str)] = &[
    ("GET", "/health"),
    ("POST", "/users"),
    ("GET", "/users"),
    ("DELETE", "/users/:username"),
    ("GET", "/volumes"),
    ("GET", "/volumes/usage"),
    ("GET", "/volumes/:name/usage"),
    ("POST", "/volumes/:name/grow"),
    ("POST", "/volumes/:name/shrink"),
    ("POST", "/containers"),
    ("GET", "/containers"),
    ("POST", "/containers/:reference/start"),
    ("POST", "/containers/:reference/stop"),
    ("DELETE", "/containers/:reference"),
];

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/users", post(create_user).get(list_users))
        .route("/users/:username", delete(delete_user))
        .route("/volumes", get(list_volumes))
        .route("/volumes/usage", get(usage_all))
        .route("/volumes/:name/usage", get(volume_usage))
        .route("/volumes/:name/grow", post(grow_volume))
        .route("/volumes/:name/shrink", post(shrink_volume))
        .route("/containers", post(create_container).get(list_containers))
        .route("/containers/:reference", delete(remove_container))
        .route("/containers/:reference/start", post(start_container))
        .route("/containers/:reference/stop", post(stop_container))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tenantdb-server"
    }))
}

/// Root endpoint with server info.
async fn root_handler() -> impl IntoResponse {
    let routes: Vec<_> = ROUTES
        .iter()
        .map(|(method, path)| serde_json::json!({ "method": method, "path": path }))
        .collect();
    Json(serde_json::json!({
        "service": "tenantdb-server",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
    }))
}

// ============================================================================
// Users
// ============================================================================

async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<NewUser>,
) -> ApiResult<(StatusCode, Json<CreateUserResult>)> {
    let (user, volume) = state.tenants.create_user(request).await?;
    Ok((StatusCode::CREATED, Json(CreateUserResult { user, volume })))
}

async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.tenants.list_users().await?))
}

async fn delete_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<Json<DeleteUserResult>> {
    state.tenants.delete_user(&username).await?;
    Ok(Json(DeleteUserResult {
        username,
        deleted: true,
    }))
}

// ============================================================================
// Volumes
// ============================================================================

async fn list_volumes(State(state): State<AppState>) -> ApiResult<Json<Vec<Volume>>> {
    Ok(Json(state.volumes.list().await?))
}

async fn usage_all(State(state): State<AppState>) -> ApiResult<Json<Vec<UsageReport>>> {
    Ok(Json(state.volumes.usage_all().await?))
}

async fn volume_usage(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<VolumeUsage>> {
    Ok(Json(state.volumes.usage(&name).await?))
}

async fn grow_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<GrowParams>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.volumes.grow(&name, params.add_mb).await?))
}

async fn shrink_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<ShrinkParams>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.volumes.shrink(&name, params.reduce_mb).await?))
}

// ============================================================================
// Containers
// ============================================================================

async fn create_container(
    State(state): State<AppState>,
    Json(params): Json<CreateContainerParams>,
) -> ApiResult<(StatusCode, Json<Container>)> {
    let container = state.containers.create(&params.owner, &params.kind).await?;
    Ok((StatusCode::CREATED, Json(container)))
}

async fn list_containers(State(state): State<AppState>) -> ApiResult<Json<Vec<Container>>> {
    Ok(Json(state.containers.list().await?))
}

async fn start_container(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<ContainerActionResult>> {
    let container = state.containers.start(&reference).await?;
    Ok(Json(ContainerActionResult {
        name: container.name,
        action: "started",
    }))
}

async fn stop_container(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<ContainerActionResult>> {
    let container = state.containers.stop(&reference).await?;
    Ok(Json(ContainerActionResult {
        name: container.name,
        action: "stopped",
    }))
}

async fn remove_container(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<ContainerActionResult>> {
    let container = state.containers.remove(&reference).await?;
    Ok(Json(ContainerActionResult {
        name: container.name,
        action: "removed",
    }))
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tenantdb_core::testing::{FakeRuntime, FakeToolchain};
    use tenantdb_core::{ProvisionerConfig, SqliteRegistry, TenantConfig, VolumeConfig};
    use tower::ServiceExt;

    async fn test_state() -> (AppState, Arc<FakeToolchain>) {
        let registry = Arc::new(SqliteRegistry::in_memory().await.unwrap());
        let tools = Arc::new(FakeToolchain::new());
        let runtime = Arc::new(FakeRuntime::new());
        let volumes = Arc::new(VolumeLifecycleManager::new(
            registry.clone(),
            tools.clone(),
            runtime.clone(),
            VolumeConfig::default(),
        ));
        let containers = Arc::new(ContainerProvisioner::new(
            registry.clone(),
            volumes.clone(),
            tools.clone(),
            runtime,
            ProvisionerConfig::default(),
        ));
        let tenants = Arc::new(TenantService::new(
            registry,
            volumes.clone(),
            containers.clone(),
            TenantConfig::default(),
        ));
        let state = AppState {
            tenants,
            volumes,
            containers,
        };
        (state, tools)
    }

    async fn call(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = test_state().await;
        let router = build_router(state);
        let (status, body) = call(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_user_volume_container_flow() {
        let (state, _) = test_state().await;
        let router = build_router(state);

        let (status, body) = call(
            &router,
            Method::POST,
            "/users",
            Some(json!({ "username": "alice", "quota_mb": 2048 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["quota_mb"], 2048);
        let volume = body["volume"]["name"].as_str().unwrap().to_string();

        let (status, body) =
            call(&router, Method::GET, &format!("/volumes/{volume}/usage"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_mb"], 2048);

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/volumes/{volume}/grow"),
            Some(json!({ "add_mb": 512 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["capacity_mb"], 2560);

        let (status, body) = call(
            &router,
            Method::POST,
            "/containers",
            Some(json!({ "owner": "alice", "kind": "mysql" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let name = body["name"].as_str().unwrap().to_string();

        let (status, body) =
            call(&router, Method::POST, &format!("/containers/{name}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "stopped");

        let (status, _) =
            call(&router, Method::DELETE, &format!("/containers/{name}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&router, Method::DELETE, "/users/alice", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&router, Method::GET, "/volumes", None).await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (state, tools) = test_state().await;
        let router = build_router(state);

        let (status, body) = call(&router, Method::DELETE, "/users/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));

        let (status, _) = call(
            &router,
            Method::POST,
            "/containers",
            Some(json!({ "owner": "nobody", "kind": "mysql" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let user = json!({ "username": "bob" });
        let (status, _) = call(&router, Method::POST, "/users", Some(user.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&router, Method::POST, "/users", Some(user)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        tools.fail_on("allocate");
        let (status, body) = call(
            &router,
            Method::POST,
            "/users",
            Some(json!({ "username": "carol" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_usage_all_lists_every_volume() {
        let (state, _) = test_state().await;
        let router = build_router(state);
        for name in ["alice", "bob"] {
            let body = json!({ "username": name });
            call(&router, Method::POST, "/users", Some(body)).await;
        }
        let (status, body) = call(&router, Method::GET, "/volumes/usage", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["usage"]["total_mb"], 1024);
    }
}
