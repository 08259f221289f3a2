//! Multipart staging: file parts stream into the job's upload directory,
//! text parts become tool parameters.

use async_trait::async_trait;
use axum::extract::Multipart;
use axum::http::HeaderMap;

use convertd_core::JobError;
use convertd_jobs::{JobInput, StagingContext};
use convertd_tool_runtime::ToolRequest;

/// Room for multipart boundaries and text fields on top of the file payload.
pub(crate) const MULTIPART_OVERHEAD: u64 = 64 * 1024;

pub struct MultipartInput {
    multipart: Multipart,
    operation: String,
    max_files: usize,
}

impl MultipartInput {
    pub fn new(multipart: Multipart, operation: impl Into<String>, max_files: usize) -> Self {
        Self {
            multipart,
            operation: operation.into(),
            max_files,
        }
    }
}

#[async_trait]
impl JobInput for MultipartInput {
    async fn stage(self: Box<Self>, ctx: StagingContext<'_>) -> Result<ToolRequest, JobError> {
        let MultipartInput {
            mut multipart,
            operation,
            max_files,
        } = *self;
        let mut request = ToolRequest::new(operation);

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| JobError::invalid(format!("Malformed multipart body: {}", e.body_text())))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(filename) => {
                    if request.inputs.len() >= max_files {
                        return Err(JobError::invalid(format!(
                            "At most {max_files} file(s) may be uploaded"
                        )));
                    }
                    let path = ctx
                        .storage
                        .write_upload(ctx.area, &filename, field, None, ctx.limits.max_input_bytes)
                        .await
                        .map_err(|e| e.into_job_error())?;
                    request.inputs.push(path);
                }
                None if name.is_empty() => {}
                None => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| JobError::invalid(format!("Unreadable form field '{name}': {}", e.body_text())))?;
                    request = request.with_param(&name, value);
                }
            }
        }

        if request.inputs.is_empty() {
            return Err(JobError::invalid("A file upload is required"));
        }
        Ok(request)
    }
}

/// Refuse a body whose declared length already exceeds what the job may accept.
///
/// Runs before admission so an oversized upload never takes a ticket.
pub fn check_declared_length(headers: &HeaderMap, max_input_bytes: u64, max_files: usize) -> Result<(), JobError> {
    let declared = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let allowed = max_input_bytes
        .saturating_mul(max_files.max(1) as u64)
        .saturating_add(MULTIPART_OVERHEAD);
    match declared {
        Some(len) if len > allowed => Err(JobError::oversized(format!(
            "Upload exceeds the {} MB limit",
            (max_input_bytes / (1024 * 1024)).max(1)
        ))),
        _ => Ok(()),
    }
}
