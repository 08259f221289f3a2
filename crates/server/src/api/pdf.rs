//! PDF rendering endpoints. Every successful call retains its PDF for download.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use convertd_core::{JobError, JobKind};
use convertd_tool_runtime::ToolRequest;

use crate::state::AppState;
use crate::upload::MultipartInput;

use super::{error_response, json_body, multipart_body, precheck_upload, submit};

/// Most files accepted by `from-images` and `merge`.
pub(crate) const MAX_PDF_INPUTS: usize = 50;

/// Options shared by the text-like sources.
#[derive(Debug, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RenderOptions {
    /// A4, A3, A5, Letter, or Legal.
    pub page_size: Option<String>,
    /// Download name; `.pdf` is appended when missing.
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TextToPdfRequest {
    pub text: String,
    /// Point size, 6 to 36.
    pub font_size: Option<u64>,
    #[serde(flatten)]
    pub options: RenderOptions,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct HtmlToPdfRequest {
    pub html: String,
    #[serde(flatten)]
    pub options: RenderOptions,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct MarkdownToPdfRequest {
    pub markdown: String,
    #[serde(flatten)]
    pub options: RenderOptions,
}

fn render_request(operation: &str, source: (&str, String), options: RenderOptions) -> ToolRequest {
    let mut request = ToolRequest::new(operation).with_param(source.0, source.1);
    if let Some(page_size) = options.page_size {
        request = request.with_param("page_size", page_size);
    }
    if let Some(filename) = options.filename {
        request = request.with_param("filename", filename);
    }
    request
}

/// Inline sources are bounded by the render input limit like uploads are.
fn check_inline_size(state: &AppState, source: &str) -> Result<(), Response> {
    let limit = state.executor.limits_for(JobKind::Render).max_input_bytes;
    if source.len() as u64 > limit {
        return Err(error_response(&JobError::oversized(format!(
            "Source exceeds the {} MB limit",
            (limit / (1024 * 1024)).max(1)
        ))));
    }
    Ok(())
}

/// Render plain text into a PDF.
#[utoipa::path(
    post,
    path = "/pdf/from-text",
    tag = "PDF",
    request_body = TextToPdfRequest,
    responses(
        (status = 200, description = "PDF created; `data.files[0].url` downloads it", body = super::EnvelopeDoc),
        (status = 400, description = "Invalid option", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc)
    )
)]
pub async fn pdf_from_text(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TextToPdfRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_inline_size(&state, &req.text) {
        return resp;
    }
    let mut request = render_request("from-text", ("text", req.text), req.options);
    if let Some(font_size) = req.font_size {
        request = request.with_param("font_size", font_size);
    }
    submit(&state, JobKind::Render, Box::new(request), true).await
}

/// Render an HTML document into a PDF.
#[utoipa::path(
    post,
    path = "/pdf/from-html",
    tag = "PDF",
    request_body = HtmlToPdfRequest,
    responses(
        (status = 200, description = "PDF created", body = super::EnvelopeDoc),
        (status = 400, description = "Invalid option", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc)
    )
)]
pub async fn pdf_from_html(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<HtmlToPdfRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_inline_size(&state, &req.html) {
        return resp;
    }
    let request = render_request("from-html", ("html", req.html), req.options);
    submit(&state, JobKind::Render, Box::new(request), true).await
}

/// Render Markdown into a PDF.
#[utoipa::path(
    post,
    path = "/pdf/from-markdown",
    tag = "PDF",
    request_body = MarkdownToPdfRequest,
    responses(
        (status = 200, description = "PDF created", body = super::EnvelopeDoc),
        (status = 400, description = "Invalid option", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc)
    )
)]
pub async fn pdf_from_markdown(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MarkdownToPdfRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_inline_size(&state, &req.markdown) {
        return resp;
    }
    let request = render_request("from-markdown", ("markdown", req.markdown), req.options);
    submit(&state, JobKind::Render, Box::new(request), true).await
}

/// Combine images into one PDF, one image per page, in upload order.
#[utoipa::path(
    post,
    path = "/pdf/from-images",
    tag = "PDF",
    request_body(content_type = "multipart/form-data", description = "One or more `files`; optional `filename`"),
    responses(
        (status = 200, description = "PDF created", body = super::EnvelopeDoc),
        (status = 400, description = "Unsupported image", body = super::EnvelopeDoc),
        (status = 413, description = "An image exceeds the upload limit", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc)
    )
)]
pub async fn pdf_from_images(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if let Err(resp) = precheck_upload(&state, &headers, JobKind::Render, MAX_PDF_INPUTS) {
        return resp;
    }
    let multipart = match multipart_body(multipart) {
        Ok(multipart) => multipart,
        Err(resp) => return resp,
    };
    let input = MultipartInput::new(multipart, "from-images", MAX_PDF_INPUTS);
    submit(&state, JobKind::Render, Box::new(input), true).await
}

/// Concatenate PDFs in upload order.
#[utoipa::path(
    post,
    path = "/pdf/merge",
    tag = "PDF",
    request_body(content_type = "multipart/form-data", description = "Two or more PDF `files`; optional `filename`"),
    responses(
        (status = 200, description = "Merged PDF created", body = super::EnvelopeDoc),
        (status = 400, description = "Not a PDF, or fewer than two files", body = super::EnvelopeDoc),
        (status = 413, description = "A PDF exceeds the upload limit", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc)
    )
)]
pub async fn pdf_merge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if let Err(resp) = precheck_upload(&state, &headers, JobKind::Render, MAX_PDF_INPUTS) {
        return resp;
    }
    let multipart = match multipart_body(multipart) {
        Ok(multipart) => multipart,
        Err(resp) => return resp,
    };
    let input = MultipartInput::new(multipart, "merge", MAX_PDF_INPUTS);
    submit(&state, JobKind::Render, Box::new(input), true).await
}
