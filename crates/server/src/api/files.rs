//! Downloads of retained job outputs.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use convertd_core::{JobError, JobId};
use convertd_jobs::ResponseEnvelope;
use convertd_storage::StorageError;
use convertd_tool_runtime::content_type_for;

use crate::state::AppState;

use super::{envelope_response, error_response};

fn not_found(message: &str) -> Response {
    envelope_response(
        404,
        ResponseEnvelope {
            success: false,
            error: Some(message.to_string()),
            data: json!({ "error_kind": "not_found" }),
        },
    )
}

fn parse_job_id(raw: &str) -> Result<JobId, Response> {
    Uuid::parse_str(raw).map_err(|_| error_response(&JobError::invalid("Job id is not a valid UUID")))
}

/// Download one retained output file.
#[utoipa::path(
    get,
    path = "/files/{job_id}/{name}",
    tag = "Files",
    params(
        ("job_id" = String, Path, description = "Job id from the creating response"),
        ("name" = String, Path, description = "File name from `data.files[].name`")
    ),
    responses(
        (status = 200, description = "File contents"),
        (status = 400, description = "Malformed job id or file name", body = super::EnvelopeDoc),
        (status = 404, description = "No such file, or already swept", body = super::EnvelopeDoc)
    )
)]
pub async fn files_download(
    State(state): State<Arc<AppState>>,
    Path((job_id, name)): Path<(String, String)>,
) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let (path, size) = match state.executor.storage().output_file(job_id, &name).await {
        Ok(found) => found,
        Err(StorageError::NotFound(_)) => return not_found("File not found"),
        Err(e) => return error_response(&e.into_job_error()),
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        // Swept between the lookup and the open.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found("File not found"),
        Err(e) => return error_response(&StorageError::Io(e).into_job_error()),
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(&path).to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\"")),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

/// Delete a job's retained outputs once they have been downloaded.
#[utoipa::path(
    delete,
    path = "/files/{job_id}",
    tag = "Files",
    params(("job_id" = String, Path, description = "Job id from the creating response")),
    responses(
        (status = 200, description = "Outputs deleted", body = super::EnvelopeDoc),
        (status = 400, description = "Malformed job id, or the job is still running", body = super::EnvelopeDoc),
        (status = 404, description = "Nothing retained for this job", body = super::EnvelopeDoc)
    )
)]
pub async fn files_delete(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.executor.storage().consume_output(job_id).await {
        Ok(true) => envelope_response(200, ResponseEnvelope::ok(json!({ "job_id": job_id, "deleted": true }))),
        Ok(false) => not_found("No retained outputs for this job"),
        Err(e) => error_response(&e.into_job_error()),
    }
}
