use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::run::{JobDateResult, JobRun, ReportType, StageLogEntry};
use crate::runner::TriggerAck;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trigger", post(trigger_report))
        .route("/:date/:report_type/latest", get(latest_result))
        .route("/runs/:run_id", get(run_detail))
}

#[derive(Deserialize)]
struct TriggerRequest {
    scheduled_date: String,
    report_type: String,
    trigger_source: Option<String>,
}

/// POST /api/reports/trigger - open a run and acknowledge immediately.
/// Only malformed input (400) and a duplicate running key (409) reject;
/// the run's eventual outcome is queryable state, never a transport error.
async fn trigger_report(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<TriggerAck>), AppError> {
    let date = parse_date(&req.scheduled_date)?;
    let report_type: ReportType = req
        .report_type
        .parse()
        .map_err(AppError::Validation)?;
    let source = req.trigger_source.as_deref().unwrap_or("api");

    let ack = state.runner.trigger(date, report_type, source).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

/// GET /api/reports/:date/:report_type/latest - the latest-outcome pointer
async fn latest_result(
    Path((date, report_type)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<JobDateResult>, AppError> {
    let date = parse_date(&date)?;
    let report_type: ReportType = report_type.parse().map_err(AppError::Validation)?;

    let latest = state
        .registry
        .get_latest(date, report_type)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(latest))
}

#[derive(Serialize)]
struct RunDetail {
    run: JobRun,
    stages: Vec<StageLogEntry>,
}

/// GET /api/reports/runs/:run_id - full run record with its stage log
async fn run_detail(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<RunDetail>, AppError> {
    let run = state
        .registry
        .get_run(&run_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let stages = state.registry.stage_log(&run_id).await?;
    Ok(Json(RunDetail { run, stages }))
}

fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    raw.parse::<NaiveDate>()
        .map_err(|_| AppError::Validation(format!("invalid date: {}", raw)))
}
