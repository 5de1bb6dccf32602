//! The `conductor serve` command: HTTP control API, worker channel, and
//! event stream on one listener.

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use conductor_core::error::{CoreError, ErrorKind};
use conductor_core::orchestrator::{Orchestrator, SubmitTask};
use conductor_db::models::{
    Checkpoint, CheckpointFrequency, CorrectionCategory, PrivacyLevel, Subtask, Task, TaskStatus,
    Worker, WorkerResidency, WorkerStatus,
};
use conductor_db::queries::checkpoints as checkpoint_db;
use conductor_db::queries::evaluations as evaluation_db;
use conductor_db::queries::subtasks as subtask_db;
use conductor_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// HTTP-facing error: a `CoreError` plus the request path.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: serde_json::Value,
    path: String,
}

impl AppError {
    /// Map an engine error onto the HTTP status taxonomy.
    pub fn from_core(err: CoreError, uri: &Uri) -> Self {
        let status = match err.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Unavailable | ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Fatal | ErrorKind::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.message,
            details: err.details,
            path: uri.path().to_owned(),
        }
    }

    pub fn internal(err: anyhow::Error, uri: &Uri) -> Self {
        Self::from_core(CoreError::infrastructure(format!("{err:#}")), uri)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": self.code,
            "message": self.message,
            "details": self.details,
            "path": self.path,
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: PgPool,
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub checkpoint_frequency: Option<CheckpointFrequency>,
    #[serde(default)]
    pub privacy: Option<PrivacyLevel>,
    #[serde(default)]
    pub preferred_tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub subtasks: Vec<Subtask>,
    pub latest_checkpoint: Option<Checkpoint>,
    pub aggregate_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: Uuid,
    pub machine_name: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub residency: Option<WorkerResidency>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkersQuery {
    pub status: Option<WorkerStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CorrectionRequest {
    pub subtask_id: Uuid,
    pub category: CorrectionCategory,
    pub guidance: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task_detail))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/workers", get(list_workers).post(register_worker))
        .route("/api/workers/{id}", get(get_worker))
        .route("/api/workers/{id}/heartbeat", post(worker_heartbeat))
        .route("/api/checkpoints/{id}", get(get_checkpoint))
        .route("/api/checkpoints/{id}/approve", post(approve_checkpoint))
        .route("/api/checkpoints/{id}/reject", post(reject_checkpoint))
        .route("/api/checkpoints/{id}/correct", post(correct_checkpoint))
        .route("/ws/worker", get(ws::worker_channel))
        .route("/ws/events", get(ws::event_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let cancel = CancellationToken::new();
    let background = tokio::spawn(
        Arc::clone(&state.orchestrator).run(cancel.clone()),
    );

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("conductor serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = background.await;
    tracing::info!("conductor serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn submit_task(
    State(state): State<AppState>,
    uri: Uri,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let task = state
        .orchestrator
        .submit_task(SubmitTask {
            description: request.description,
            requirements: request.requirements,
            checkpoint_frequency: request.checkpoint_frequency,
            privacy: request.privacy,
            preferred_tools: request.preferred_tools,
        })
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;

    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    uri: Uri,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let tasks = task_db::list_tasks(&state.pool, query.status, limit, offset)
        .await
        .map_err(|e| AppError::internal(e, &uri))?;
    let total = task_db::count_tasks(&state.pool, query.status)
        .await
        .map_err(|e| AppError::internal(e, &uri))?;

    Ok(Json(TaskListResponse { tasks, total }))
}

async fn get_task_detail(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e, &uri))?
        .ok_or_else(|| {
            AppError::from_core(CoreError::not_found(format!("task {id} not found")), &uri)
        })?;

    let subtasks = subtask_db::list_subtasks_for_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e, &uri))?;
    let latest_checkpoint = checkpoint_db::latest_for_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e, &uri))?;
    let aggregate_score = evaluation_db::aggregate_for_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e, &uri))?;

    Ok(Json(TaskDetailResponse {
        task,
        subtasks,
        latest_checkpoint,
        aggregate_score,
    }))
}

async fn cancel_task(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = state
        .orchestrator
        .cancel_task(id)
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// Worker handlers
// ---------------------------------------------------------------------------

async fn list_workers(
    State(state): State<AppState>,
    uri: Uri,
    Query(query): Query<ListWorkersQuery>,
) -> Result<Json<Vec<Worker>>, AppError> {
    let workers = state
        .orchestrator
        .registry()
        .list(query.status)
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok(Json(workers))
}

async fn get_worker(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
) -> Result<Json<Worker>, AppError> {
    let worker = state
        .orchestrator
        .registry()
        .get(id)
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok(Json(worker))
}

async fn register_worker(
    State(state): State<AppState>,
    uri: Uri,
    Json(request): Json<RegisterWorkerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let worker = state
        .orchestrator
        .registry()
        .register(
            request.worker_id,
            &request.machine_name,
            &request.capabilities,
            request.residency.unwrap_or(WorkerResidency::Remote),
        )
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .orchestrator
        .registry()
        .heartbeat(
            id,
            conductor_core::dispatch::ResourceSnapshot {
                cpu_pct: request.cpu_pct,
                mem_pct: request.mem_pct,
                disk_pct: request.disk_pct,
            },
        )
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Checkpoint handlers
// ---------------------------------------------------------------------------

async fn get_checkpoint(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
) -> Result<Json<Checkpoint>, AppError> {
    let checkpoint = checkpoint_db::get_checkpoint(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e, &uri))?
        .ok_or_else(|| {
            AppError::from_core(
                CoreError::not_found(format!("checkpoint {id} not found")),
                &uri,
            )
        })?;
    Ok(Json(checkpoint))
}

async fn approve_checkpoint(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
    request: Option<Json<DecisionRequest>>,
) -> Result<Json<Checkpoint>, AppError> {
    let notes = request.and_then(|Json(r)| r.notes);
    let checkpoint = state
        .orchestrator
        .approve_checkpoint(id, notes.as_deref())
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok(Json(checkpoint))
}

async fn reject_checkpoint(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
    request: Option<Json<DecisionRequest>>,
) -> Result<Json<Checkpoint>, AppError> {
    let notes = request.and_then(|Json(r)| r.notes);
    let checkpoint = state
        .orchestrator
        .reject_checkpoint(id, notes.as_deref())
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok(Json(checkpoint))
}

async fn correct_checkpoint(
    State(state): State<AppState>,
    uri: Uri,
    Path(id): Path<Uuid>,
    Json(request): Json<CorrectionRequest>,
) -> Result<Json<Checkpoint>, AppError> {
    let checkpoint = state
        .orchestrator
        .correct_checkpoint(id, request.subtask_id, request.category, &request.guidance)
        .await
        .map_err(|e| AppError::from_core(e, &uri))?;
    Ok(Json(checkpoint))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use conductor_core::CoreConfig;
    use conductor_test_utils::{create_test_db, drop_test_db};

    async fn test_state(pool: PgPool) -> AppState {
        let orchestrator = Orchestrator::new(pool.clone(), CoreConfig::default(), None)
            .expect("orchestrator should build");
        AppState { orchestrator, pool }
    }

    async fn send_json(
        state: AppState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let app = build_router(state);
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_task_returns_created_task() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let response = send_json(
            state,
            "POST",
            "/api/tasks",
            Some(serde_json::json!({
                "description": "Build user authentication",
                "checkpoint_frequency": "low",
                "preferred_tools": ["claude"],
            })),
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        // Decomposition ran (template fallback without an LLM): the task
        // is admitted and running.
        assert_eq!(json["status"], "running");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn submit_task_empty_description_is_validation_error() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let response = send_json(
            state,
            "POST",
            "/api/tasks",
            Some(serde_json::json!({ "description": "   " })),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "validation");
        assert_eq!(json["path"], "/api/tasks");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_task_detail_includes_subtasks() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let submitted = send_json(
            state.clone(),
            "POST",
            "/api/tasks",
            Some(serde_json::json!({ "description": "Build user authentication" })),
        )
        .await;
        let task_id = body_json(submitted).await["id"].as_str().unwrap().to_owned();

        let response = send_json(state, "GET", &format!("/api/tasks/{task_id}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let subtasks = json["subtasks"].as_array().expect("subtasks array");
        assert_eq!(subtasks.len(), 6, "auth template yields six subtasks");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_missing_task_is_404() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let response = send_json(
            state,
            "GET",
            &format!("/api/tasks/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_twice_is_idempotent() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let submitted = send_json(
            state.clone(),
            "POST",
            "/api/tasks",
            Some(serde_json::json!({ "description": "Refactor the storage layer" })),
        )
        .await;
        let task_id = body_json(submitted).await["id"].as_str().unwrap().to_owned();

        let first = send_json(
            state.clone(),
            "POST",
            &format!("/api/tasks/{task_id}/cancel"),
            None,
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = send_json(
            state,
            "POST",
            &format!("/api/tasks/{task_id}/cancel"),
            None,
        )
        .await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_json(second).await["status"], "cancelled");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn register_and_list_workers() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;
        let worker_id = Uuid::new_v4();

        let response = send_json(
            state.clone(),
            "POST",
            "/api/workers",
            Some(serde_json::json!({
                "worker_id": worker_id,
                "machine_name": "builder-1",
                "capabilities": ["claude", "gemini"],
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let listed = send_json(state, "GET", "/api/workers", None).await;
        let json = body_json(listed).await;
        let workers = json.as_array().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0]["machine_name"], "builder-1");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn heartbeat_unknown_worker_is_404() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let response = send_json(
            state,
            "POST",
            &format!("/api/workers/{}/heartbeat", Uuid::new_v4()),
            Some(serde_json::json!({ "cpu_pct": 1.0, "mem_pct": 2.0, "disk_pct": 3.0 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn approve_missing_checkpoint_is_404() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let response = send_json(
            state,
            "POST",
            &format!("/api/checkpoints/{}/approve", Uuid::new_v4()),
            Some(serde_json::json!({ "notes": "fine" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
