use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::domain::TaskStatus;

use super::{error::ApiError, ApiState};

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/tasks", get(get_tasks))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop-all", post(stop_all))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub paused: bool,
    /// Production estimates currently come from seasonal averages
    pub pv_degraded: bool,
    pub window_len: usize,
    pub tasks: Vec<TaskStatus>,
}

/// Nothing published and nothing ingested: the engine has not completed a
/// cycle since start-up
fn ensure_ready(st: &ApiState) -> Result<(Vec<TaskStatus>, usize), ApiError> {
    let tasks = st.scheduler.statuses().borrow().clone();
    let window_len = st.scheduler.window_snapshot().len();
    if tasks.is_empty() && window_len == 0 {
        return Err(ApiError::ServiceUnavailable(
            "no scheduling cycle has completed yet".to_string(),
        ));
    }
    Ok((tasks, window_len))
}

pub async fn get_status(State(st): State<ApiState>) -> Result<Json<SystemStatus>, ApiError> {
    let (tasks, window_len) = ensure_ready(&st)?;
    Ok(Json(SystemStatus {
        paused: st.scheduler.is_paused(),
        pv_degraded: st.predictor.is_degraded(),
        window_len,
        tasks,
    }))
}

pub async fn get_tasks(State(st): State<ApiState>) -> Result<Json<Vec<String>>, ApiError> {
    let (tasks, _) = ensure_ready(&st)?;
    Ok(Json(tasks.into_iter().map(|s| s.desc).collect()))
}

pub async fn pause(State(st): State<ApiState>) -> impl IntoResponse {
    st.scheduler.pause();
    StatusCode::NO_CONTENT
}

pub async fn resume(State(st): State<ApiState>) -> impl IntoResponse {
    st.scheduler.resume();
    StatusCode::NO_CONTENT
}

pub async fn stop_all(State(st): State<ApiState>) -> impl IntoResponse {
    st.scheduler.stop_all().await;
    StatusCode::NO_CONTENT
}
