//! Liveness, service info, endpoint index, and recent job history.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use convertd_core::JobKind;
use convertd_jobs::ExecutorStats;

use crate::state::AppState;

use super::query_params;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Health ───────────────────────────────────────────────────────

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// Liveness only. Never touches tools or storage.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    responses((status = 200, description = "Process is up", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// ── Info ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct InfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub executor: ExecutorStats,
    pub config: Value,
    pub tools: Vec<convertd_tool_runtime::ToolStatus>,
    pub ocr_languages: Vec<String>,
}

/// Limits, live counters, and tool availability. No filesystem paths.
#[utoipa::path(
    get,
    path = "/info",
    tag = "System",
    responses((status = 200, description = "Service configuration and live counters"))
)]
pub async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        service: "convertd",
        version: VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
        executor: state.executor.stats(),
        config: state.config.redacted_summary(),
        tools: state.tool_statuses(),
        ocr_languages: state.executor.registry().ocr_languages(),
    })
}

// ── Index ────────────────────────────────────────────────────────

/// Endpoint index for humans poking at the root.
#[utoipa::path(
    get,
    path = "/",
    tag = "System",
    responses((status = 200, description = "Endpoint index"))
)]
pub async fn root() -> Json<Value> {
    let media_ops = ["info", "trim", "resize", "compress", "extract-audio", "thumbnail", "convert", "merge"];
    Json(json!({
        "service": "convertd",
        "version": VERSION,
        "documentation": "/docs",
        "health": "/health",
        "info": "/info",
        "endpoints": {
            (JobKind::Fetch.as_str()): [
                "/crawl/scrape",
                "/crawl/scrape/html",
                "/crawl/scrape/text",
                "/crawl/scrape/meta",
                "/crawl/scrape/deep"
            ],
            (JobKind::Ocr.as_str()): ["/ocr/image", "/ocr/pdf", "/ocr/languages"],
            (JobKind::Render.as_str()): ["/pdf/from-text", "/pdf/from-html", "/pdf/from-markdown", "/pdf/from-images", "/pdf/merge"],
            (JobKind::Transcode.as_str()): media_ops.iter().map(|op| format!("/ffmpeg/{op}")).collect::<Vec<_>>(),
            "files": ["/files/{job_id}/{name}"],
            "jobs": ["/jobs/recent"],
        },
    }))
}

// ── Job history ──────────────────────────────────────────────────

#[derive(Deserialize, utoipa::IntoParams)]
pub struct RecentParams {
    /// Maximum number of records (default 50, max 200).
    pub limit: Option<usize>,
}

/// Terminal job records, newest first.
#[utoipa::path(
    get,
    path = "/jobs/recent",
    tag = "System",
    params(RecentParams),
    responses(
        (status = 200, description = "Recent job records"),
        (status = 400, description = "Invalid limit", body = super::EnvelopeDoc)
    )
)]
pub async fn jobs_recent(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RecentParams>, QueryRejection>,
) -> Response {
    let params = match query_params(params) {
        Ok(params) => params,
        Err(resp) => return resp,
    };
    let limit = params.limit.unwrap_or(50).min(convertd_jobs::DEFAULT_HISTORY);
    let records = state.executor.history().recent(limit);
    Json(json!({ "count": records.len(), "jobs": records })).into_response()
}
