//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::ops::StartRun;
use crate::storage::runs;

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/retry", post(retry_run))
        .route("/cron-jobs", get(list_cron_jobs))
        .route("/cron-jobs/{id}/run", post(run_cron_job))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route("/queue", get(queue_status))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs(State(state): State<AppState>, Query(params): Query<ListParams>) -> ApiResult<Json<Value>> {
    let limit = params.limit.unwrap_or(50).min(500);
    let runs = runs::list_recent(state.ops.pool(), limit)?;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRun>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let run = state.ops.start_run(&req)?;
    Ok((StatusCode::CREATED, Json(json!({ "data": run }))))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let run = state.ops.get_run(id)?;
    Ok(Json(json!({ "data": run, "meta": { "duration": run.duration_formatted() } })))
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let run = state.ops.cancel_run(id)?;
    Ok(Json(json!({ "data": run })))
}

async fn retry_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let run = state.ops.retry_run(id)?;
    Ok((StatusCode::CREATED, Json(json!({ "data": run, "meta": { "retry_of": id } }))))
}

async fn list_cron_jobs(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let jobs = state.scheduler.list_jobs().await?;
    Ok(Json(json!({ "data": jobs, "meta": { "total": jobs.len() } })))
}

async fn run_cron_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let message_id = state.ops.run_cron_now(id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "cron_job_id": id, "message_id": message_id } })),
    ))
}

#[derive(Debug, Deserialize)]
struct DryRunParams {
    hours: Option<u64>,
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    Query(params): Query<DryRunParams>,
) -> ApiResult<Json<Value>> {
    let upcoming = state
        .scheduler
        .preview_next_runs(params.hours.unwrap_or(24).min(24 * 7))
        .await?;
    Ok(Json(json!({ "data": { "upcoming": upcoming } })))
}

async fn queue_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let queues = state.ops.queue_stats()?;
    Ok(Json(json!({ "data": queues, "meta": { "total": queues.len() } })))
}
