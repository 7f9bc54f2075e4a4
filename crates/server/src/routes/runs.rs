use std::convert::Infallible;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Json as ResponseJson, Response},
    routing::{get, post},
};
use db::models::{
    run::{CreateRun, Run, RunError, RunStatus},
    thread::{Thread, ThreadError},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use services::services::streaming::{StreamFilter, StreamMode};
use utils::{response::ApiResponse, sse::SseMessage};
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// `stream_mode` accepts a single mode or a list, mirroring the wire format
/// of LangGraph-style clients.
#[derive(Debug, Clone, Deserialize, ts_rs::TS)]
#[serde(untagged)]
#[ts(export)]
pub enum StreamModeSpec {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct CreateRunRequest {
    pub assistant_id: Option<String>,
    #[ts(type = "unknown | null")]
    pub input: Option<Value>,
    #[ts(type = "unknown | null")]
    pub config: Option<Value>,
    #[ts(type = "unknown | null")]
    pub context: Option<Value>,
    pub stream_mode: Option<StreamModeSpec>,
    pub stream_subgraphs: Option<bool>,
    /// Accepted for wire compatibility; reconnection behavior is always
    /// "continue and replay".
    pub on_disconnect: Option<String>,
    #[ts(type = "unknown | null")]
    pub feedback_keys: Option<Value>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub last_event_id: Option<String>,
    /// Comma-separated modes for reconnects, e.g. `values,updates`.
    pub stream_mode: Option<String>,
}

#[derive(Debug, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct UpdateRunRequest {
    pub status: String,
}

fn filter_from_spec(spec: Option<&StreamModeSpec>) -> Result<StreamFilter, ApiError> {
    let raw: Vec<&str> = match spec {
        None => return Ok(StreamFilter::default()),
        Some(StreamModeSpec::One(mode)) => vec![mode.as_str()],
        Some(StreamModeSpec::Many(modes)) => modes.iter().map(String::as_str).collect(),
    };
    parse_modes(raw)
}

fn filter_from_query(raw: Option<&str>) -> Result<StreamFilter, ApiError> {
    match raw {
        None => Ok(StreamFilter::default()),
        Some(csv) => parse_modes(csv.split(',').map(str::trim).filter(|s| !s.is_empty())),
    }
}

fn parse_modes<'a>(raw: impl IntoIterator<Item = &'a str>) -> Result<StreamFilter, ApiError> {
    let mut modes = Vec::new();
    for mode in raw {
        modes.push(mode.parse::<StreamMode>().map_err(ApiError::BadRequest)?);
    }
    Ok(StreamFilter::new(modes))
}

/// Build the SSE response around a rendered message stream. Headers keep
/// proxies from buffering and let browsers resend `Last-Event-ID`.
fn sse_response(
    stream: impl Stream<Item = SseMessage> + Send + 'static,
    location: Option<String>,
) -> Result<Response, ApiError> {
    let body = Body::from_stream(stream.map(|msg| Ok::<_, Infallible>(msg.format())));

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Last-Event-ID");
    if let Some(location) = location {
        builder = builder.header(header::LOCATION, location);
    }
    builder
        .body(body)
        .map_err(|e| ApiError::InternalError(e.to_string()))
}

async fn create_and_spawn(
    state: &AppState,
    thread_id: Uuid,
    payload: &CreateRunRequest,
) -> Result<Run, ApiError> {
    Thread::find_by_id(&state.db().pool, thread_id)
        .await?
        .ok_or(ThreadError::NotFound)?;

    if payload.config.is_some() && payload.context.is_some() {
        return Err(ApiError::BadRequest(
            "config and context are mutually exclusive".into(),
        ));
    }
    let input = payload
        .input
        .clone()
        .ok_or_else(|| ApiError::BadRequest("input is required".into()))?;

    let run = Run::create(
        &state.db().pool,
        &CreateRun {
            thread_id,
            assistant_id: payload.assistant_id.clone(),
            input,
            config: payload.config.clone(),
            context: payload.context.clone(),
            user_id: payload.user_id.clone(),
        },
    )
    .await?;

    state.engine().spawn(&run).await?;
    tracing::debug!("spawned run {} on thread {thread_id}", run.id);
    Ok(run)
}

async fn find_thread_run(state: &AppState, thread_id: Uuid, run_id: Uuid) -> Result<Run, ApiError> {
    let run = Run::find_by_id(&state.db().pool, run_id)
        .await?
        .ok_or(RunError::NotFound)?;
    if run.thread_id != thread_id {
        return Err(RunError::NotFound.into());
    }
    Ok(run)
}

pub async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(payload): Json<CreateRunRequest>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    // stream_mode is validated even though nothing is streamed back here,
    // so a bad request fails fast instead of on reconnect
    filter_from_spec(payload.stream_mode.as_ref())?;
    let run = create_and_spawn(&state, thread_id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn create_run_stream(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(payload): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    let filter = filter_from_spec(payload.stream_mode.as_ref())?;
    let run = create_and_spawn(&state, thread_id, &payload).await?;

    // canonical run URL; clients that lose this response reconnect at
    // its /stream sub-resource
    let location = format!("/threads/{thread_id}/runs/{}", run.id);
    let stream = state.streaming().stream_run(run, None, filter);
    sse_response(stream, Some(location))
}

pub async fn stream_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let run = find_thread_run(&state, thread_id, run_id).await?;
    let filter = filter_from_query(query.stream_mode.as_deref())?;

    // the header wins over the query parameter; browsers set it on
    // automatic EventSource reconnects
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.last_event_id);

    let stream = state.streaming().stream_run(run, last_event_id, filter);
    sse_response(stream, None)
}

pub async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let run = find_thread_run(&state, thread_id, run_id).await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<RunListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Run>>>, ApiError> {
    Thread::find_by_id(&state.db().pool, thread_id)
        .await?
        .ok_or(ThreadError::NotFound)?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let runs = Run::find_by_thread_id(&state.db().pool, thread_id, status).await?;
    Ok(ResponseJson(ApiResponse::success(runs)))
}

/// The only accepted status update is `interrupted`, which requests
/// cooperative cancellation. Terminal runs are returned as-is.
pub async fn update_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateRunRequest>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    if payload.status != "interrupted" {
        return Err(ApiError::BadRequest(format!(
            "unsupported status update '{}'; only 'interrupted' is allowed",
            payload.status
        )));
    }
    find_thread_run(&state, thread_id, run_id).await?;

    let outcome = state.engine().interrupt(run_id).await?;
    if !outcome.found {
        tracing::debug!("interrupt for run {run_id} found no live execution");
    }
    Ok(ResponseJson(ApiResponse::success(outcome.run)))
}

/// Block until the run is terminal and return its output unwrapped, so
/// polling clients get exactly what the streaming clients saw last.
pub async fn join_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<Option<Value>>, ApiError> {
    find_thread_run(&state, thread_id, run_id).await?;

    let run = state
        .engine()
        .join(run_id, state.config().join_timeout())
        .await?;

    match run.status {
        RunStatus::Error => Err(ApiError::InternalError(
            run.error_message
                .unwrap_or_else(|| "run failed".to_string()),
        )),
        _ => Ok(ResponseJson(run.output.map(|json| json.0))),
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/threads/{thread_id}/runs", post(create_run).get(list_runs))
        .route("/threads/{thread_id}/runs/stream", post(create_run_stream))
        .route(
            "/threads/{thread_id}/runs/{run_id}",
            get(get_run).post(update_run),
        )
        .route("/threads/{thread_id}/runs/{run_id}/stream", get(stream_run))
        .route("/threads/{thread_id}/runs/{run_id}/join", get(join_run))
}
