//! OCR endpoints: single images and PDFs.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Serialize;

use convertd_core::JobKind;

use crate::state::AppState;
use crate::upload::MultipartInput;

use super::{multipart_body, precheck_upload, submit};

#[derive(Serialize, utoipa::ToSchema)]
pub struct LanguagesResponse {
    pub default: String,
    pub languages: Vec<String>,
}

/// Recognize text in one image.
#[utoipa::path(
    post,
    path = "/ocr/image",
    tag = "OCR",
    request_body(
        content_type = "multipart/form-data",
        description = "`file` (jpg, png, webp, tif, bmp); optional `language` (e.g. `eng+deu`) and `output_format` (text, hocr, tsv, json)"
    ),
    responses(
        (status = 200, description = "Recognized text", body = super::EnvelopeDoc),
        (status = 400, description = "Unsupported image or invalid option", body = super::EnvelopeDoc),
        (status = 413, description = "Image exceeds the upload limit", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc),
        (status = 504, description = "OCR deadline exceeded", body = super::EnvelopeDoc)
    )
)]
pub async fn ocr_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if let Err(resp) = precheck_upload(&state, &headers, JobKind::Ocr, 1) {
        return resp;
    }
    let multipart = match multipart_body(multipart) {
        Ok(multipart) => multipart,
        Err(resp) => return resp,
    };
    let input = MultipartInput::new(multipart, "image", 1);
    submit(&state, JobKind::Ocr, Box::new(input), false).await
}

/// Recognize text in a PDF, page by page.
#[utoipa::path(
    post,
    path = "/ocr/pdf",
    tag = "OCR",
    request_body(
        content_type = "multipart/form-data",
        description = "`file` (pdf); optional `language`, `pages` (e.g. `1,3,5`), `dpi`, and `output_format` (text, hocr, tsv, json)"
    ),
    responses(
        (status = 200, description = "Text per page", body = super::EnvelopeDoc),
        (status = 400, description = "Not a PDF, invalid option, or page past the end", body = super::EnvelopeDoc),
        (status = 413, description = "PDF exceeds the upload or page limit", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc),
        (status = 504, description = "OCR deadline exceeded", body = super::EnvelopeDoc)
    )
)]
pub async fn ocr_pdf(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if let Err(resp) = precheck_upload(&state, &headers, JobKind::Ocr, 1) {
        return resp;
    }
    let multipart = match multipart_body(multipart) {
        Ok(multipart) => multipart,
        Err(resp) => return resp,
    };
    let input = MultipartInput::new(multipart, "pdf", 1);
    submit(&state, JobKind::Ocr, Box::new(input), false).await
}

/// Languages the OCR engine reported at startup.
#[utoipa::path(
    get,
    path = "/ocr/languages",
    tag = "OCR",
    responses((status = 200, description = "Installed languages", body = LanguagesResponse))
)]
pub async fn ocr_languages(State(state): State<Arc<AppState>>) -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        default: state.config.ocr.default_lang.clone(),
        languages: state.executor.registry().ocr_languages(),
    })
}
