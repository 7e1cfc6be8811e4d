//! REST surface of the rollout controller. Handlers stay thin: parse,
//! delegate to the controller, map errors to status codes. Stage math and
//! state-machine rules live in `rollout-core`.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use rollout_core::{
    DeploymentController, DeploymentError, DeploymentFilter, NewDeployment, NewModelVersion,
};

#[derive(Clone)]
pub struct AppState {
    pub controller: DeploymentController,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: AppState, enable_cors: bool, request_timeout: Duration) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route(
            "/model-versions",
            post(register_model_version).get(list_model_versions),
        )
        .route("/deployments", post(create_deployment).get(list_deployments))
        .route("/deployments/active", get(active_deployments))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/metrics", get(deployment_metrics))
        .route("/deployments/:id/start", post(start_deployment))
        .route("/deployments/:id/progress", post(progress_deployment))
        .route(
            "/deployments/:id/progress/force",
            post(force_progress_deployment),
        )
        .route("/deployments/:id/promote", post(promote_deployment))
        .route("/deployments/:id/rollback", post(rollback_deployment))
        .route("/deployments/:id/cancel", post(cancel_deployment))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state);

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }
    router
}

/// API error envelope. Validation and state-machine violations map to
/// 400, unknown resources to 404, infrastructure failures to 500.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<DeploymentError> for ApiError {
    fn from(err: DeploymentError) -> Self {
        match err {
            DeploymentError::Validation(_)
            | DeploymentError::Config(_)
            | DeploymentError::InvalidState { .. }
            | DeploymentError::StageNotElapsed { .. }
            | DeploymentError::AlreadyAtFinalStage
            | DeploymentError::NotFullyRolledOut { .. }
            | DeploymentError::ReasonRequired => ApiError::BadRequest(err.to_string()),
            DeploymentError::NotFound(_) => ApiError::NotFound(err.to_string()),
            DeploymentError::Store(_)
            | DeploymentError::Fleet(_)
            | DeploymentError::Telemetry(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        let body = Json(json!({
            "error": message,
            "timestamp": Utc::now().to_rfc3339(),
        }));
        (status, body).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "status": "ok",
        "uptimeSeconds": uptime,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn register_model_version(
    State(state): State<AppState>,
    Json(request): Json<NewModelVersion>,
) -> Result<impl IntoResponse, ApiError> {
    let model_version = state.controller.register_model_version(request)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "modelVersion": model_version })),
    ))
}

async fn list_model_versions(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let versions = state.controller.model_versions()?;
    let count = versions.len();
    Ok(Json(json!({
        "modelVersions": versions,
        "count": count,
    })))
}

async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<NewDeployment>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.controller.create(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "deployment": deployment })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    model_version_id: Option<String>,
    status: Option<String>,
    strategy: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let strategy = query
        .strategy
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let filter = DeploymentFilter {
        model_version_id: query.model_version_id,
        status,
        strategy,
        page: query.page,
        page_size: query.page_size,
    };
    let page = state.controller.list(&filter)?;
    let total_pages = (page.total + page.page_size - 1) / page.page_size;
    Ok(Json(json!({
        "deployments": page.deployments,
        "pagination": {
            "page": page.page,
            "pageSize": page.page_size,
            "total": page.total,
            "totalPages": total_pages,
        },
    })))
}

async fn active_deployments(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployments = state.controller.active()?;
    let count = deployments.len();
    Ok(Json(json!({
        "deployments": deployments,
        "count": count,
    })))
}

async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let details = state.controller.get(id).await?;
    Ok(Json(serde_json::to_value(details).map_err(|err| {
        ApiError::Internal(format!("failed to encode deployment details: {err}"))
    })?))
}

async fn deployment_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let metrics = state.controller.metrics(id).await?;
    Ok(Json(serde_json::to_value(metrics).map_err(|err| {
        ApiError::Internal(format!("failed to encode metrics: {err}"))
    })?))
}

async fn start_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.controller.start(id).await?;
    Ok(Json(json!({
        "deployment": deployment,
        "message": "deployment started; monitoring active",
    })))
}

async fn progress_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.controller.progress(id).await?;
    Ok(Json(json!({
        "deployment": deployment,
        "message": format!("traffic advanced to {}%", deployment.traffic_percentage),
    })))
}

async fn force_progress_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.controller.progress_with_override(id).await?;
    Ok(Json(json!({
        "deployment": deployment,
        "message": format!(
            "dwell gate overridden; traffic advanced to {}%",
            deployment.traffic_percentage
        ),
    })))
}

async fn promote_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.controller.promote(id).await?;
    Ok(Json(json!({
        "deployment": deployment,
        "message": "deployment promoted to full production",
    })))
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    reason: String,
}

async fn rollback_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RollbackRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reason = body.map(|Json(body)| body.reason).unwrap_or_default();
    let deployment = state.controller.rollback(id, &reason).await?;
    Ok(Json(json!({
        "deployment": deployment,
        "message": "deployment rolled back",
        "reason": reason,
    })))
}

async fn cancel_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = state.controller.cancel(id).await?;
    Ok(Json(json!({
        "deployment": deployment,
        "message": "deployment cancelled",
    })))
}
