//! Admin HTTP service

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use livefire_common::{
    ConnectionParams, Database, Error, HypervisorConnector, RevertEvent, RevertOptions,
    RevertOutcome, RevertTarget, SnapshotRevert,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{require_admin, AdminAuth};
use crate::locks::VmLocks;

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 1000;

/// Admin service configuration
#[derive(Clone)]
pub struct WebServerConfig {
    /// Admin token. Generated at startup when unset.
    pub admin_token: Option<String>,
    /// Hypervisor connection. Revert routes answer 503 while unset.
    pub connection: Option<ConnectionParams>,
    /// Snapshot used for targets without an override
    pub baseline_snapshot: String,
    /// Bounds on remote task waits
    pub revert: RevertOptions,
}

impl std::fmt::Debug for WebServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebServerConfig")
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("connection", &self.connection)
            .field("baseline_snapshot", &self.baseline_snapshot)
            .field("revert", &self.revert)
            .finish()
    }
}

/// Admin service
#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebServerState>,
}

struct WebServerState {
    db: Database,
    reverter: SnapshotRevert,
    connection: Option<ConnectionParams>,
    baseline_snapshot: String,
    locks: VmLocks,
    auth: AdminAuth,
}

pub async fn serve(
    addr: SocketAddr,
    cfg: WebServerConfig,
    db: Database,
    connector: Arc<dyn HypervisorConnector>,
) -> anyhow::Result<()> {
    let server = WebServer::new(cfg, db, connector);
    server.serve(addr).await
}

impl WebServer {
    pub fn new(cfg: WebServerConfig, db: Database, connector: Arc<dyn HypervisorConnector>) -> Self {
        if cfg.connection.is_none() {
            warn!("Hypervisor connection is not configured; revert routes are disabled");
        }

        Self {
            state: Arc::new(WebServerState {
                db,
                reverter: SnapshotRevert::new(connector, cfg.revert),
                connection: cfg.connection,
                baseline_snapshot: cfg.baseline_snapshot,
                locks: VmLocks::new(),
                auth: AdminAuth::from_config(cfg.admin_token),
            }),
        }
    }

    /// Per-VM locks held while a revert or power-on is in flight
    pub fn locks(&self) -> &VmLocks {
        &self.state.locks
    }

    /// Create router
    pub fn router(&self) -> Router {
        let admin_routes = Router::new()
            .route("/targets", get(list_targets_handler).post(create_target_handler))
            .route(
                "/targets/:id",
                get(get_target_handler)
                    .put(update_target_handler)
                    .delete(delete_target_handler),
            )
            .route("/targets/:id/revert", post(revert_target_handler))
            .route("/targets/:id/power-on", post(power_on_target_handler))
            .route("/targets/:id/snapshots", get(snapshots_handler))
            .route("/targets/:id/events", get(events_handler))
            // Trigger route kept for existing scoreboard integrations
            .route("/revert", get(legacy_revert_handler).post(legacy_revert_handler))
            .layer(middleware::from_fn_with_state(
                self.state.auth.clone(),
                require_admin,
            ));

        Router::new()
            .route("/healthz", get(health_handler))
            .nest("/admin", admin_routes)
            .fallback(not_found_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the admin service
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("Admin service starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Handler error, rendered as `{"error", "message", "partial", "count"?}`
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    /// Work on this VM is already in flight
    Busy(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyExists { .. } | Error::AmbiguousVm { .. } | Error::SnapshotMatch { .. } => {
            StatusCode::CONFLICT
        }
        Error::Connection(_)
        | Error::Api { .. }
        | Error::RevertTask(_)
        | Error::PowerOnTask(_) => StatusCode::BAD_GATEWAY,
        Error::TaskTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::InvalidConfig(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Core(e) => {
                let status = status_for(&e);
                let mut body = serde_json::json!({
                    "error": e.kind(),
                    "message": e.to_string(),
                    "partial": e.is_partial(),
                });
                if let Some(count) = e.match_count() {
                    body["count"] = serde_json::json!(count);
                }
                (status, Json(body)).into_response()
            }
            ApiError::Busy(vm) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "busy",
                    "message": format!("a revert or power-on is already in progress for VM {}", vm),
                    "partial": false,
                })),
            )
                .into_response(),
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "livefire-web",
        "version": livefire_common::VERSION,
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not_found", "message": "no such route", "partial": false})),
    )
}

#[derive(Debug, Deserialize)]
struct CreateTargetRequest {
    name: String,
    vm_name: String,
    #[serde(default)]
    snapshot_name: Option<String>,
}

/// Partial update. An empty `snapshot_name` clears the override.
#[derive(Debug, Deserialize)]
struct UpdateTargetRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    vm_name: Option<String>,
    #[serde(default)]
    snapshot_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RevertQuery {
    id: Option<String>,
}

fn required(field: &str, value: &str) -> ApiResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidRequest(format!("{} must not be empty", field)).into());
    }
    Ok(value.to_string())
}

fn optional_snapshot(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn load_target(state: &WebServerState, id: &str) -> ApiResult<RevertTarget> {
    state.db.get_target(id)?.ok_or_else(|| {
        ApiError::Core(Error::NotFound {
            kind: "target".to_string(),
            name: id.to_string(),
        })
    })
}

fn connection(state: &WebServerState) -> ApiResult<ConnectionParams> {
    state.connection.clone().ok_or_else(|| {
        ApiError::Core(Error::InvalidConfig(
            "hypervisor connection is not configured".to_string(),
        ))
    })
}

async fn list_targets_handler(
    State(state): State<Arc<WebServerState>>,
) -> ApiResult<Json<Vec<RevertTarget>>> {
    Ok(Json(state.db.list_targets()?))
}

async fn create_target_handler(
    State(state): State<Arc<WebServerState>>,
    Json(req): Json<CreateTargetRequest>,
) -> ApiResult<(StatusCode, Json<RevertTarget>)> {
    let target = RevertTarget::new(required("name", &req.name)?, required("vm_name", &req.vm_name)?)
        .with_snapshot_name(optional_snapshot(req.snapshot_name));
    state.db.insert_target(&target)?;

    info!(target = %target.name, vm = %target.vm_name, "Created revert target");
    Ok((StatusCode::CREATED, Json(target)))
}

async fn get_target_handler(
    State(state): State<Arc<WebServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RevertTarget>> {
    Ok(Json(load_target(&state, &id)?))
}

async fn update_target_handler(
    State(state): State<Arc<WebServerState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTargetRequest>,
) -> ApiResult<Json<RevertTarget>> {
    let mut target = load_target(&state, &id)?;

    if let Some(name) = req.name {
        target.name = required("name", &name)?;
    }
    if let Some(vm_name) = req.vm_name {
        target.vm_name = required("vm_name", &vm_name)?;
    }
    if req.snapshot_name.is_some() {
        target.snapshot_name = optional_snapshot(req.snapshot_name);
    }

    state.db.update_target(&target)?;
    Ok(Json(load_target(&state, &target.id)?))
}

async fn delete_target_handler(
    State(state): State<Arc<WebServerState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let target = load_target(&state, &id)?;
    state.db.delete_target(&target.id)?;

    info!(target = %target.name, "Deleted revert target");
    Ok(StatusCode::NO_CONTENT)
}

async fn revert_target_handler(
    State(state): State<Arc<WebServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    run_revert(&state, &id).await
}

async fn legacy_revert_handler(
    State(state): State<Arc<WebServerState>>,
    Query(query): Query<RevertQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = query
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::Core(Error::InvalidRequest("missing id".to_string())))?;
    run_revert(&state, &id).await
}

/// Run `work` with the VM's lock held on a spawned task.
///
/// A client that disconnects mid-request drops only the wait on the handle:
/// the lock stays held and history is recorded until the remote work settles.
async fn locked<T, F, Fut>(state: &Arc<WebServerState>, vm_name: &str, work: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<WebServerState>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ApiResult<T>> + Send + 'static,
{
    let guard = state
        .locks
        .try_acquire(vm_name)
        .ok_or_else(|| ApiError::Busy(vm_name.to_string()))?;

    let state = state.clone();
    let handle = tokio::spawn(async move {
        let result = work(state).await;
        drop(guard);
        result
    });

    handle.await.map_err(|e| {
        ApiError::Core(Error::Internal(format!("revert worker aborted: {}", e)))
    })?
}

async fn run_revert(state: &Arc<WebServerState>, id: &str) -> ApiResult<Json<serde_json::Value>> {
    let target = load_target(state, id)?;
    let params = connection(state)?;
    let snapshot = target.snapshot_or(&state.baseline_snapshot).to_string();
    let vm_name = target.vm_name.clone();

    locked(state, &vm_name, move |state| async move {
        let result = state
            .reverter
            .revert(&params, &target.vm_name, &snapshot)
            .await;

        let (outcome, message) = match &result {
            Ok(receipt) => (
                RevertOutcome::Succeeded,
                format!("reverted to snapshot {}", receipt.snapshot.id),
            ),
            Err(e) if e.is_partial() => (RevertOutcome::Partial, e.to_string()),
            Err(e) => (RevertOutcome::Failed, e.to_string()),
        };
        record_event(&state, &target, "revert", Some(snapshot.as_str()), outcome, message);

        let receipt = result?;
        state.db.record_revert(&target.id, receipt.completed_at)?;
        let target = load_target(&state, &target.id)?;

        Ok(Json(serde_json::json!({
            "target": target,
            "receipt": receipt,
            "last_revert_at": target.last_revert_at,
        })))
    })
    .await
}

async fn power_on_target_handler(
    State(state): State<Arc<WebServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = load_target(&state, &id)?;
    let params = connection(&state)?;
    let vm_name = target.vm_name.clone();

    locked(&state, &vm_name, move |state| async move {
        let result = state.reverter.power_on(&params, &target.vm_name).await;

        let (outcome, message) = match &result {
            Ok(_) => (RevertOutcome::Succeeded, "powered on".to_string()),
            Err(e) => (RevertOutcome::Failed, e.to_string()),
        };
        record_event(&state, &target, "power_on", None, outcome, message);

        let receipt = result?;
        Ok(Json(serde_json::json!({
            "target": target,
            "receipt": receipt,
        })))
    })
    .await
}

async fn snapshots_handler(
    State(state): State<Arc<WebServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let target = load_target(&state, &id)?;
    let params = connection(&state)?;

    let (vm, snapshots) = state.reverter.snapshot_tree(&params, &target.vm_name).await?;
    Ok(Json(serde_json::json!({
        "vm": vm,
        "snapshot_name": target.snapshot_or(&state.baseline_snapshot),
        "snapshots": snapshots,
    })))
}

async fn events_handler(
    State(state): State<Arc<WebServerState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<RevertEvent>>> {
    let target = load_target(&state, &id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    Ok(Json(state.db.list_events(&target.id, limit)?))
}

/// History is best-effort: a failed insert never masks the operation result.
fn record_event(
    state: &WebServerState,
    target: &RevertTarget,
    action: &str,
    snapshot_name: Option<&str>,
    outcome: RevertOutcome,
    message: String,
) {
    let event = RevertEvent {
        id: uuid::Uuid::new_v4().to_string(),
        target_id: target.id.clone(),
        action: action.to_string(),
        vm_name: target.vm_name.clone(),
        snapshot_name: snapshot_name.map(str::to_string),
        outcome,
        message,
        created_at: Utc::now(),
    };
    if let Err(e) = state.db.record_event(&event) {
        warn!(target = %target.name, "Failed to record {} event: {}", action, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use livefire_common::fake::{FakeHypervisor, FakeTask, FakeVm};
    use livefire_common::SnapshotNode;
    use std::time::Duration;
    use tower::ServiceExt;

    const TOKEN: &str = "test-admin-token";

    fn test_vm(name: &str) -> FakeVm {
        FakeVm::new(format!("vm-{}", name), name).with_snapshots(vec![SnapshotNode::new(
            "snap-root",
            "INSTALL",
        )
        .with_children(vec![SnapshotNode::new("snap-base", "BASELINE")])])
    }

    fn server_with(fake: FakeHypervisor) -> (WebServer, Database) {
        let db = Database::open_memory().unwrap();
        let cfg = WebServerConfig {
            admin_token: Some(TOKEN.to_string()),
            connection: Some(ConnectionParams::new("vcenter.lab", "admin", "secret")),
            baseline_snapshot: "BASELINE".to_string(),
            revert: RevertOptions {
                revert_timeout: Duration::from_secs(5),
                power_on_timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(1),
            },
        };
        (WebServer::new(cfg, db.clone(), Arc::new(fake)), db)
    }

    async fn wait_until_idle(server: &WebServer, vm: &str) {
        for _ in 0..1000 {
            if !server.locks().is_busy(vm) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("VM {} still locked", vm);
    }

    async fn call(
        server: &WebServer,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-livefire-admin-token", TOKEN);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = server.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create(server: &WebServer, name: &str, vm: &str) -> String {
        let (status, body) = call(
            server,
            "POST",
            "/admin/targets",
            Some(serde_json::json!({"name": name, "vm_name": vm})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (server, _) = server_with(FakeHypervisor::new());
        let response = server
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let (server, _) = server_with(FakeHypervisor::new());

        let response = server
            .router()
            .oneshot(Request::get("/admin/targets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = server
            .router()
            .oneshot(
                Request::get("/admin/targets")
                    .header("authorization", format!("Bearer {}", TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_target_crud() {
        let (server, _) = server_with(FakeHypervisor::new());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "GET", "/admin/targets/web-101", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id.as_str());
        assert!(body["snapshot_name"].is_null());

        let (status, body) = call(
            &server,
            "PUT",
            &format!("/admin/targets/{}", id),
            Some(serde_json::json!({"snapshot_name": "CLEAN"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshot_name"], "CLEAN");
        assert_eq!(body["vm_name"], "target-01");

        let (status, body) = call(
            &server,
            "POST",
            "/admin/targets",
            Some(serde_json::json!({"name": "web-101", "vm_name": "target-02"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_exists");

        let (status, body) = call(
            &server,
            "POST",
            "/admin/targets",
            Some(serde_json::json!({"name": "web-102", "vm_name": " "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _) = call(&server, "DELETE", &format!("/admin/targets/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&server, "GET", "/admin/targets/web-101", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_revert_updates_last_revert_and_history() {
        let fake = FakeHypervisor::new().with_vm(test_vm("target-01"));
        let (server, db) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["receipt"]["snapshot"]["id"], "snap-base");
        assert!(!body["last_revert_at"].is_null());

        assert_eq!(fake.reverts(), 1);
        assert_eq!(fake.power_ons(), 1);
        assert_eq!(fake.disconnects(), 1);
        assert!(db.get_target(&id).unwrap().unwrap().last_revert_at.is_some());

        let (status, body) = call(&server, "GET", &format!("/admin/targets/{}/events", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["outcome"], "succeeded");
        assert_eq!(body[0]["action"], "revert");
    }

    #[tokio::test]
    async fn test_legacy_trigger_route() {
        let fake = FakeHypervisor::new().with_vm(test_vm("target-01"));
        let (server, _) = server_with(fake.clone());
        create(&server, "web-101", "target-01").await;

        let (status, _) = call(&server, "GET", "/admin/revert?id=web-101", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fake.reverts(), 1);

        let (status, body) = call(&server, "POST", "/admin/revert", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_reports_count() {
        let vm = FakeVm::new("vm-1", "target-01").with_snapshots(vec![
            SnapshotNode::new("s1", "BASELINE"),
            SnapshotNode::new("s2", "BASELINE"),
        ]);
        let fake = FakeHypervisor::new().with_vm(vm);
        let (server, db) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "snapshot_match");
        assert_eq!(body["count"], 2);
        assert_eq!(body["partial"], false);
        assert_eq!(fake.reverts(), 0);
        assert!(db.get_target(&id).unwrap().unwrap().last_revert_at.is_none());

        let events = db.list_events(&id, 10).unwrap();
        assert_eq!(events[0].outcome, RevertOutcome::Failed);
    }

    #[tokio::test]
    async fn test_missing_vm_is_not_found() {
        let (server, _) = server_with(FakeHypervisor::new());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_power_on_failure_is_partial() {
        let fake = FakeHypervisor::new()
            .with_vm(test_vm("target-01"))
            .with_power_on_task(FakeTask::Fail("no host resources".to_string()));
        let (server, db) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "power_on_task");
        assert_eq!(body["partial"], true);
        assert!(body["message"].as_str().unwrap().contains("no host resources"));

        let events = db.list_events(&id, 10).unwrap();
        assert_eq!(events[0].outcome, RevertOutcome::Partial);
    }

    #[tokio::test]
    async fn test_power_on_timeout_is_gateway_timeout() {
        let fake = FakeHypervisor::new()
            .with_vm(test_vm("target-01"))
            .with_power_on_task(FakeTask::Hang);
        let (server, _) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "task_timeout");
        assert_eq!(body["partial"], true);
        assert_eq!(fake.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_hypervisor_is_bad_gateway() {
        let fake = FakeHypervisor::new().with_connect_error("connection refused");
        let (server, _) = server_with(fake);
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "connection");
    }

    #[tokio::test]
    async fn test_busy_vm_rejected() {
        let fake = FakeHypervisor::new().with_vm(test_vm("target-01"));
        let (server, _) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let guard = server.locks().try_acquire("target-01").unwrap();
        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "busy");
        assert_eq!(fake.calls().len(), 0);

        drop(guard);
        let (status, _) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!server.locks().is_busy("target-01"));
    }

    #[tokio::test]
    async fn test_abandoned_revert_keeps_lock_and_records() {
        let fake = FakeHypervisor::new()
            .with_vm(test_vm("target-01"))
            .with_revert_task(FakeTask::SucceedAfter(200));
        let (server, db) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;
        let uri = format!("/admin/targets/{}/revert", id);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), call(&server, "POST", &uri, None)).await;
        assert!(abandoned.is_err());
        assert!(server.locks().is_busy("target-01"));

        let (status, body) = call(&server, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "busy");

        wait_until_idle(&server, "target-01").await;
        assert_eq!(fake.reverts(), 1);
        assert_eq!(fake.power_ons(), 1);
        assert_eq!(fake.disconnects(), 1);

        let events = db.list_events(&id, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, RevertOutcome::Succeeded);
        assert!(db.get_target(&id).unwrap().unwrap().last_revert_at.is_some());
    }

    #[tokio::test]
    async fn test_abandoned_power_on_keeps_lock() {
        let fake = FakeHypervisor::new()
            .with_vm(test_vm("target-01"))
            .with_power_on_task(FakeTask::SucceedAfter(40));
        let (server, db) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            call(&server, "POST", &format!("/admin/targets/{}/power-on", id), None),
        )
        .await;
        assert!(abandoned.is_err());

        let (status, _) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        wait_until_idle(&server, "target-01").await;
        assert_eq!(fake.reverts(), 0);
        assert_eq!(fake.disconnects(), 1);
        let events = db.list_events(&id, 10).unwrap();
        assert_eq!(events[0].action, "power_on");
        assert_eq!(events[0].outcome, RevertOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_event_limit_is_clamped() {
        let (server, db) = server_with(FakeHypervisor::new());
        let id = create(&server, "web-101", "target-01").await;
        let target = db.get_target(&id).unwrap().unwrap();
        for i in 0..(MAX_EVENT_LIMIT + 5) {
            record_event(
                &server.state,
                &target,
                "revert",
                Some("BASELINE"),
                RevertOutcome::Failed,
                format!("attempt {}", i),
            );
        }

        let (status, body) = call(
            &server,
            "GET",
            &format!("/admin/targets/{}/events?limit={}", id, u64::MAX),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), MAX_EVENT_LIMIT);

        let (_, body) = call(&server, "GET", &format!("/admin/targets/{}/events?limit=0", id), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_power_on_route() {
        let fake = FakeHypervisor::new().with_vm(test_vm("target-01"));
        let (server, db) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/power-on", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["receipt"]["vm"]["name"], "target-01");
        assert_eq!(fake.reverts(), 0);
        assert_eq!(fake.power_ons(), 1);

        let events = db.list_events(&id, 10).unwrap();
        assert_eq!(events[0].action, "power_on");
    }

    #[tokio::test]
    async fn test_snapshot_tree_route() {
        let fake = FakeHypervisor::new().with_vm(test_vm("target-01"));
        let (server, _) = server_with(fake.clone());
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "GET", &format!("/admin/targets/{}/snapshots", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshot_name"], "BASELINE");
        assert_eq!(body["snapshots"][0]["name"], "INSTALL");
        assert_eq!(body["snapshots"][0]["children"][0]["name"], "BASELINE");
        assert_eq!(fake.reverts(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_connection() {
        let db = Database::open_memory().unwrap();
        let cfg = WebServerConfig {
            admin_token: Some(TOKEN.to_string()),
            connection: None,
            baseline_snapshot: "BASELINE".to_string(),
            revert: RevertOptions::default(),
        };
        let server = WebServer::new(cfg, db, Arc::new(FakeHypervisor::new()));
        let id = create(&server, "web-101", "target-01").await;

        let (status, body) = call(&server, "POST", &format!("/admin/targets/{}/revert", id), None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "invalid_config");
    }
}
