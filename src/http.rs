use crate::catalog::{navigate, progress_percentage};
use crate::model::{GameSession, Level, LevelSummary, NavigateAction, QueryResult};
use crate::service::{elapsed_ms, QueryService};
use crate::session::{SessionStore, SessionUpdate};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

const MAX_HINT_LEVEL: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    pub sessions: Arc<dyn SessionStore>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: msg.into() }))
}

fn invalid_request(rejection: JsonRejection) -> (StatusCode, Json<ApiError>) {
    debug!(reason = %rejection.body_text(), "rejected request body");
    api_error(StatusCode::BAD_REQUEST, "Invalid request data")
}

fn session_not_found() -> (StatusCode, Json<ApiError>) {
    api_error(StatusCode::NOT_FOUND, "Session not found")
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: GameSession,
}

#[derive(Debug, Serialize)]
pub struct SessionProgressResponse {
    pub session: GameSession,
    pub progress: u32,
}

#[derive(Debug, Serialize)]
pub struct LevelResponse {
    pub level: Level,
}

#[derive(Debug, Serialize)]
pub struct LevelsResponse {
    pub levels: Vec<LevelSummary>,
}

#[derive(Debug, Serialize)]
pub struct ResultResponse {
    pub result: QueryResult,
}

#[derive(Debug, Serialize)]
pub struct HintResponse {
    pub hint: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub levels: usize,
    pub sandboxes: usize,
    pub provisioned: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub session_id: String,
    pub level: u32,
    pub query: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintRequest {
    /// Hints are counted against this session when given.
    #[serde(default)]
    pub session_id: Option<String>,
    pub level: u32,
    pub hint_level: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateRequest {
    pub session_id: String,
    pub level: u32,
    pub action: NavigateAction,
    #[serde(default)]
    pub target_level: Option<u32>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/session", post(api_create_session))
        .route(
            "/api/session/{id}",
            get(api_get_session).delete(api_cleanup_session),
        )
        .route("/api/session/{id}/result", get(api_latest_result))
        .route("/api/levels", get(api_levels))
        .route("/api/level/{id}", get(api_level))
        .route("/api/level/navigate", post(api_navigate))
        .route("/api/execute", post(api_execute))
        .route("/api/hint", post(api_hint))
        .with_state(state)
}

async fn api_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let pool = state.service.pool();
    Json(HealthResponse {
        status: "ok",
        levels: state.service.catalog().len(),
        sandboxes: pool.len(),
        provisioned: pool.provisioned_total(),
    })
}

async fn api_create_session(State(state): State<AppState>) -> Json<SessionResponse> {
    let session = state.sessions.create_session().await;
    info!(session_id = %session.id, "session created");
    Json(SessionResponse { session })
}

async fn api_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionProgressResponse> {
    let session = state
        .sessions
        .get_session(&id)
        .await
        .ok_or_else(session_not_found)?;
    let progress = progress_percentage(session.current_level);
    Ok(Json(SessionProgressResponse { session, progress }))
}

async fn api_cleanup_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    let released = state.service.pool().release_session(&id);
    let existed = state.sessions.delete_session(&id).await;
    info!(session_id = %id, released, existed, "session cleaned up");
    StatusCode::NO_CONTENT
}

async fn api_latest_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ResultResponse> {
    let result = state
        .sessions
        .latest_query_result(&id)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No query result found"))?;
    Ok(Json(ResultResponse { result }))
}

async fn api_levels(State(state): State<AppState>) -> Json<LevelsResponse> {
    let levels = state.service.catalog().levels().map(LevelSummary::from).collect();
    Json(LevelsResponse { levels })
}

async fn api_level(
    State(state): State<AppState>,
    id: Result<Path<u32>, PathRejection>,
) -> ApiResult<LevelResponse> {
    let not_found = || api_error(StatusCode::NOT_FOUND, "Level not found");
    let Path(id) = id.map_err(|_| not_found())?;
    let level = state.service.catalog().get(id).cloned().ok_or_else(not_found)?;
    Ok(Json(LevelResponse { level }))
}

async fn api_execute(
    State(state): State<AppState>,
    req: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<ResultResponse> {
    let started = Instant::now();
    let Json(req) = req.map_err(invalid_request)?;
    if state.sessions.get_session(&req.session_id).await.is_none() {
        return Err(session_not_found());
    }

    let service = Arc::clone(&state.service);
    let session_id = req.session_id.clone();
    let level_id = req.level;
    let result = tokio::task::spawn_blocking(move || {
        service.execute_query(&req.session_id, req.level, &req.query)
    })
    .await
    .unwrap_or_else(|e| {
        error!(session_id = %session_id, level_id, error = %e, "query task failed");
        QueryResult::failed(format!("System error: {e}"), elapsed_ms(started))
    });

    let stored = state
        .sessions
        .store_query_result(&session_id, result.clone())
        .await;
    if !stored {
        // Deleted while the query ran.
        let released = state.service.pool().release_session(&session_id);
        debug!(session_id = %session_id, released, "dropped result for deleted session");
        return Err(session_not_found());
    }
    if result.is_correct() {
        let points = result.score_earned.unwrap_or(0);
        state
            .sessions
            .update_session(&session_id, SessionUpdate::AddScore(points))
            .await;
        info!(session_id = %session_id, level_id, points, "level solved");
    }

    Ok(Json(ResultResponse { result }))
}

async fn api_hint(
    State(state): State<AppState>,
    req: Result<Json<HintRequest>, JsonRejection>,
) -> ApiResult<HintResponse> {
    let Json(req) = req.map_err(invalid_request)?;
    if !(1..=MAX_HINT_LEVEL).contains(&req.hint_level) {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid request data"));
    }
    if let Some(id) = &req.session_id {
        if state.sessions.get_session(id).await.is_none() {
            return Err(session_not_found());
        }
    }

    let hint = state
        .service
        .catalog()
        .hint(req.level, req.hint_level)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Hint not found"))?
        .to_string();
    if let Some(id) = &req.session_id {
        state
            .sessions
            .update_session(id, SessionUpdate::RecordHint)
            .await;
    }
    debug!(session_id = ?req.session_id, level_id = req.level, hint_level = req.hint_level, "hint served");
    Ok(Json(HintResponse { hint }))
}

async fn api_navigate(
    State(state): State<AppState>,
    req: Result<Json<NavigateRequest>, JsonRejection>,
) -> ApiResult<SessionResponse> {
    let Json(req) = req.map_err(invalid_request)?;
    let target = navigate(req.level, req.action, req.target_level);
    let session = state
        .sessions
        .update_session(&req.session_id, SessionUpdate::SetLevel(target))
        .await
        .ok_or_else(session_not_found)?;
    debug!(session_id = %session.id, from = req.level, to = target, "level changed");
    Ok(Json(SessionResponse { session }))
}
