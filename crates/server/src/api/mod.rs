//! Domain-focused API endpoint modules.
//!
//! One sub-module per job kind plus health/info and downloads.
//! The job submission helpers shared by every kind live here.

mod crawl;
pub mod doc;
mod ffmpeg;
mod files;
mod health;
mod ocr;
mod pdf;

use std::sync::Arc;

use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use convertd_core::{JobError, JobKind};
use convertd_jobs::{JobInput, ResponseEnvelope};

use crate::state::AppState;
use crate::upload::check_declared_length;

// ── Shared types ─────────────────────────────────────────────────

/// OpenAPI mirror of the `{ success, error, data }` envelope.
#[derive(Serialize, utoipa::ToSchema)]
#[schema(as = ResponseEnvelope)]
pub struct EnvelopeDoc {
    pub success: bool,
    pub error: Option<String>,
    #[schema(value_type = Object)]
    pub data: Value,
}

// ── Submission helpers ───────────────────────────────────────────

pub(crate) fn envelope_response(status: u16, envelope: ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope)).into_response()
}

/// An error raised before a job exists (bad route parameters, oversized body).
pub(crate) fn error_response(error: &JobError) -> Response {
    envelope_response(error.http_status(), ResponseEnvelope::failure(error))
}

// ── Extractor rejections ─────────────────────────────────────────
// Handlers take `Result<Extractor, Rejection>` so a malformed body still
// answers with a 400 envelope instead of axum's plain-text rejection.

pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| error_response(&JobError::invalid(format!("Invalid JSON body: {}", e.body_text()))))
}

pub(crate) fn multipart_body(payload: Result<Multipart, MultipartRejection>) -> Result<Multipart, Response> {
    payload.map_err(|e| error_response(&JobError::invalid(format!("Invalid multipart body: {}", e.body_text()))))
}

pub(crate) fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, Response> {
    params
        .map(|Query(params)| params)
        .map_err(|e| error_response(&JobError::invalid(format!("Invalid query: {}", e.body_text()))))
}

/// Run a job and answer with its envelope.
///
/// The job runs detached, so a client that hangs up does not abort it.
pub(crate) async fn submit(
    state: &AppState,
    kind: JobKind,
    input: Box<dyn JobInput>,
    retain_output: bool,
) -> Response {
    let outcome = Arc::clone(&state.executor)
        .run_detached(kind, input, retain_output)
        .await;
    let (status, envelope) = state.results.build(&outcome);
    envelope_response(status, envelope)
}

/// Reject a body whose `Content-Length` is over the kind's input limit.
pub(crate) fn precheck_upload(
    state: &AppState,
    headers: &HeaderMap,
    kind: JobKind,
    max_files: usize,
) -> Result<(), Response> {
    let limit = state.executor.limits_for(kind).max_input_bytes;
    check_declared_length(headers, limit, max_files).map_err(|e| error_response(&e))
}

// ── Re-exports ───────────────────────────────────────────────────
// Flat `api::foo` paths used by router.rs route registration.

pub use crawl::{crawl_scrape, crawl_scrape_deep, crawl_scrape_html, crawl_scrape_meta, crawl_scrape_text};
pub use ffmpeg::ffmpeg_operation;
pub use files::{files_delete, files_download};
pub use health::{health, info, jobs_recent, root};
pub use ocr::{ocr_image, ocr_languages, ocr_pdf};
pub use pdf::{pdf_from_html, pdf_from_images, pdf_from_markdown, pdf_from_text, pdf_merge};

pub(crate) use ffmpeg::MAX_MERGE_INPUTS;
pub(crate) use pdf::MAX_PDF_INPUTS;
