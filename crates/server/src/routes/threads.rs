use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::thread::{CreateThread, Thread, ThreadError};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

pub async fn create_thread(
    State(state): State<AppState>,
    Json(payload): Json<CreateThread>,
) -> Result<ResponseJson<ApiResponse<Thread>>, ApiError> {
    let thread = Thread::create(&state.db().pool, &payload).await?;
    tracing::debug!("created thread {}", thread.id);
    Ok(ResponseJson(ApiResponse::success(thread)))
}

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Thread>>, ApiError> {
    let thread = Thread::find_by_id(&state.db().pool, thread_id)
        .await?
        .ok_or(ThreadError::NotFound)?;
    Ok(ResponseJson(ApiResponse::success(thread)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/threads", post(create_thread))
        .route("/threads/{thread_id}", get(get_thread))
}
