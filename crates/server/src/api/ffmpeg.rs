//! Media endpoints, one per transcode operation.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use axum::response::Response;

use convertd_core::{JobError, JobKind};

use crate::state::AppState;
use crate::upload::MultipartInput;

use super::{error_response, multipart_body, precheck_upload, submit};

/// Operations that take more than one file.
const MULTI_INPUT: &[&str] = &["merge"];
pub(crate) const MAX_MERGE_INPUTS: usize = 10;

/// Run one transcode operation on uploaded media.
///
/// `info` answers inline; every other operation retains its output for download.
#[utoipa::path(
    post,
    path = "/ffmpeg/{operation}",
    tag = "Media",
    params(("operation" = String, Path,
        description = "info, trim, resize, compress, extract-audio, thumbnail, convert, or merge")),
    request_body(
        content_type = "multipart/form-data",
        description = "`file` (or several `files` for merge) plus operation options: \
            trim `start`/`end`/`duration`; resize `width`/`height`; compress `crf`; \
            extract-audio and convert `format`; thumbnail `timestamp`"
    ),
    responses(
        (status = 200, description = "Operation finished", body = super::EnvelopeDoc),
        (status = 400, description = "Unknown operation, unsupported media, or invalid option", body = super::EnvelopeDoc),
        (status = 413, description = "Media exceeds the upload or duration limit", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc),
        (status = 504, description = "Transcode deadline exceeded", body = super::EnvelopeDoc)
    )
)]
pub async fn ffmpeg_operation(
    State(state): State<Arc<AppState>>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let known = state
        .executor
        .registry()
        .get(JobKind::Transcode)
        .map(|a| a.operations().contains(&operation.as_str()))
        .unwrap_or(false);
    if !known {
        return error_response(&JobError::unsupported(format!(
            "Unknown media operation '{operation}'"
        )));
    }

    let max_files = if MULTI_INPUT.contains(&operation.as_str()) {
        MAX_MERGE_INPUTS
    } else {
        1
    };
    if let Err(resp) = precheck_upload(&state, &headers, JobKind::Transcode, max_files) {
        return resp;
    }
    let multipart = match multipart_body(multipart) {
        Ok(multipart) => multipart,
        Err(resp) => return resp,
    };

    let retain = operation != "info";
    let input = MultipartInput::new(multipart, operation, max_files);
    submit(&state, JobKind::Transcode, Box::new(input), retain).await
}
