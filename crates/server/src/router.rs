//! HTTP router construction.
//!
//! Assembles all Axum routes, middleware, and OpenAPI docs into a single `Router`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use convertd_core::JobKind;

use crate::api;
use crate::state::AppState;
use crate::upload::MULTIPART_OVERHEAD;

/// Per-route body ceiling: the kind's input limit for each accepted file.
fn body_limit(state: &AppState, kind: JobKind, files: usize) -> DefaultBodyLimit {
    let bytes = state
        .executor
        .limits_for(kind)
        .max_input_bytes
        .saturating_mul(files as u64)
        .saturating_add(MULTIPART_OVERHEAD);
    DefaultBodyLimit::max(usize::try_from(bytes).unwrap_or(usize::MAX))
}

/// Stamp every response with its wall-clock handling time in seconds.
async fn process_time(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut resp = next.run(req).await;
    let elapsed = format!("{:.4}", started.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        resp.headers_mut().insert("x-process-time", value);
    }
    resp
}

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ocr_limit = body_limit(&state, JobKind::Ocr, 1);
    let render_limit = body_limit(&state, JobKind::Render, 1);
    let render_multi_limit = body_limit(&state, JobKind::Render, api::MAX_PDF_INPUTS);
    let media_limit = body_limit(&state, JobKind::Transcode, api::MAX_MERGE_INPUTS);

    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/info", get(api::info))
        .route("/jobs/recent", get(api::jobs_recent))
        // Crawl
        .route("/crawl/scrape", post(api::crawl_scrape))
        .route("/crawl/scrape/html", post(api::crawl_scrape_html))
        .route("/crawl/scrape/text", post(api::crawl_scrape_text))
        .route("/crawl/scrape/meta", post(api::crawl_scrape_meta))
        .route("/crawl/scrape/deep", post(api::crawl_scrape_deep))
        // OCR
        .route("/ocr/image", post(api::ocr_image).layer(ocr_limit))
        .route("/ocr/pdf", post(api::ocr_pdf).layer(ocr_limit))
        .route("/ocr/languages", get(api::ocr_languages))
        // PDF
        .route("/pdf/from-text", post(api::pdf_from_text).layer(render_limit))
        .route("/pdf/from-html", post(api::pdf_from_html).layer(render_limit))
        .route("/pdf/from-markdown", post(api::pdf_from_markdown).layer(render_limit))
        .route("/pdf/from-images", post(api::pdf_from_images).layer(render_multi_limit))
        .route("/pdf/merge", post(api::pdf_merge).layer(render_multi_limit))
        // Media
        .route("/ffmpeg/{operation}", post(api::ffmpeg_operation).layer(media_limit))
        // Retained outputs
        .route("/files/{job_id}", axum::routing::delete(api::files_delete))
        .route("/files/{job_id}/{name}", get(api::files_download))
        .layer(middleware::from_fn(process_time))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(Scalar::with_url("/docs", api::doc::ApiDoc::openapi()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, StatusCode};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use convertd_core::Config;
    use convertd_storage::{Category, StorageManager};
    use convertd_tool_runtime::ToolRegistry;

    use crate::startup::assemble;

    async fn test_state(tmp: &TempDir) -> Arc<AppState> {
        let mut config = Config::for_profile("ROUTERTEST");
        config.storage.storage_dir = tmp.path().to_path_buf();
        let storage = StorageManager::new(tmp.path());
        storage.ensure_layout().await.unwrap();
        assemble(config, storage, ToolRegistry::new(), Vec::new())
    }

    async fn send(app: Router, req: axum::http::Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn get_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn multipart_req(uri: &str, content_length: u64) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
            .header(header::CONTENT_LENGTH, content_length.to_string())
            .body(Body::from("--XBOUNDARY--\r\n"))
            .unwrap()
    }

    fn json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_is_liveness_only() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let (status, headers, body) = send(app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "ok");
        assert!(headers.contains_key("x-process-time"));
    }

    #[tokio::test]
    async fn root_lists_endpoints() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let (status, _, body) = send(app, get_req("/")).await;
        assert_eq!(status, StatusCode::OK);
        let v = json(&body);
        assert_eq!(v["documentation"], "/docs");
        assert!(v["endpoints"]["transcode"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e == "/ffmpeg/extract-audio"));
    }

    #[tokio::test]
    async fn info_hides_storage_path() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let (status, _, body) = send(app, get_req("/info")).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(!text.contains(tmp.path().to_str().unwrap()));
        assert!(json(text.as_bytes())["executor"]["admission"].is_object());
    }

    #[tokio::test]
    async fn unknown_media_operation_is_unsupported() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let (status, _, body) = send(app, multipart_req("/ffmpeg/explode", 15)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let v = json(&body);
        assert_eq!(v["success"], false);
        assert_eq!(v["data"]["error_kind"], "unsupported_format");
    }

    #[tokio::test]
    async fn declared_oversize_is_refused_before_admission() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        let app = build_router(state.clone());
        let (status, _, body) = send(app, multipart_req("/ocr/image", 10 * 1024 * 1024 * 1024)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json(&body)["data"]["error_kind"], "oversized_input");
        assert_eq!(state.executor.admission().running_total(), 0);
        assert!(state.executor.history().recent(10).is_empty());
    }

    #[tokio::test]
    async fn job_without_adapter_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        let app = build_router(state.clone());
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/pdf/from-text")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"text":"hello"}"#))
            .unwrap();
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let v = json(&body);
        assert_eq!(v["data"]["job"]["state"], "failed");

        let recent = state.executor.history().recent(10);
        assert_eq!(recent.len(), 1);
        for category in [Category::Upload, Category::Output, Category::Temp] {
            let dir = state.executor.storage().category_dir(category);
            assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn retained_file_downloads_then_deletes() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        let job_id = uuid::Uuid::new_v4();
        let dir = state
            .executor
            .storage()
            .category_dir(Category::Output)
            .join(job_id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("report.pdf"), b"%PDF-1.7 stub").unwrap();

        let app = build_router(state.clone());
        let (status, headers, body) = send(app.clone(), get_req(&format!("/files/{job_id}/report.pdf"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/pdf");
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("report.pdf"));
        assert_eq!(body, b"%PDF-1.7 stub");

        let delete = || {
            axum::http::Request::builder()
                .method(Method::DELETE)
                .uri(format!("/files/{job_id}"))
                .body(Body::empty())
                .unwrap()
        };
        let (status, _, _) = send(app.clone(), delete()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(app.clone(), delete()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(app, get_req(&format!("/files/{job_id}/report.pdf"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_job_id_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let (status, _, _) = send(app, get_req("/files/not-a-uuid/out.pdf")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn recent_jobs_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let (status, _, body) = send(app, get_req("/jobs/recent?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["count"], 0);
    }

    #[tokio::test]
    async fn malformed_json_body_answers_with_envelope() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        let app = build_router(state.clone());
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/crawl/scrape")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"link":"https://example.com"}"#))
            .unwrap();
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let v = json(&body);
        assert_eq!(v["success"], false);
        assert_eq!(v["data"]["error_kind"], "invalid_parameters");
        assert!(v["error"].as_str().unwrap().contains("url"));
        assert!(state.executor.history().recent(10).is_empty());
    }

    #[tokio::test]
    async fn non_multipart_upload_answers_with_envelope() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/ocr/image")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["data"]["error_kind"], "invalid_parameters");
    }

    #[tokio::test]
    async fn bad_query_answers_with_envelope() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp).await);
        let (status, _, body) = send(app, get_req("/jobs/recent?limit=lots")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["success"], false);
    }

    #[tokio::test]
    async fn deep_crawl_route_is_wired() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        let app = build_router(state.clone());
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/crawl/scrape/deep")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"url":"https://example.com","max_pages":3}"#))
            .unwrap();
        let (status, _, body) = send(app, req).await;
        // Empty registry: the job is admitted, then fails for want of an adapter.
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["data"]["job"]["kind"], "fetch");
        assert_eq!(state.executor.history().recent(10).len(), 1);
    }
}
