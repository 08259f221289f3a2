//! Page fetch endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

use convertd_core::JobKind;
use convertd_tool_runtime::ToolRequest;

use crate::state::AppState;

use super::{json_body, submit};

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CrawlRequest {
    /// Absolute http(s) URL.
    pub url: String,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct DeepCrawlRequest {
    /// Absolute http(s) URL to start from.
    pub url: String,
    /// Pages to visit, at least 1; capped by MAX_CRAWL_PAGES (default 10).
    pub max_pages: Option<u64>,
    /// Follow only links on the start URL's host (default true).
    pub same_domain_only: Option<bool>,
}

async fn fetch(state: &AppState, operation: &str, payload: Result<Json<CrawlRequest>, JsonRejection>) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let request = ToolRequest::new(operation).with_param("url", req.url);
    submit(state, JobKind::Fetch, Box::new(request), false).await
}

/// Fetch a page: title, readable text, and link count.
#[utoipa::path(
    post,
    path = "/crawl/scrape",
    tag = "Crawl",
    request_body = CrawlRequest,
    responses(
        (status = 200, description = "Page summary", body = super::EnvelopeDoc),
        (status = 400, description = "Not an http(s) URL", body = super::EnvelopeDoc),
        (status = 500, description = "Upstream failure or page over the size ceiling", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc),
        (status = 504, description = "Fetch deadline exceeded", body = super::EnvelopeDoc)
    )
)]
pub async fn crawl_scrape(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CrawlRequest>, JsonRejection>,
) -> Response {
    fetch(&state, "scrape", payload).await
}

/// Fetch a page's raw HTML.
#[utoipa::path(
    post,
    path = "/crawl/scrape/html",
    tag = "Crawl",
    request_body = CrawlRequest,
    responses((status = 200, description = "Raw HTML", body = super::EnvelopeDoc))
)]
pub async fn crawl_scrape_html(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CrawlRequest>, JsonRejection>,
) -> Response {
    fetch(&state, "html", payload).await
}

/// Fetch a page's readable text.
#[utoipa::path(
    post,
    path = "/crawl/scrape/text",
    tag = "Crawl",
    request_body = CrawlRequest,
    responses((status = 200, description = "Readable text", body = super::EnvelopeDoc))
)]
pub async fn crawl_scrape_text(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CrawlRequest>, JsonRejection>,
) -> Response {
    fetch(&state, "text", payload).await
}

/// Fetch a page's title, description, and Open Graph tags.
#[utoipa::path(
    post,
    path = "/crawl/scrape/meta",
    tag = "Crawl",
    request_body = CrawlRequest,
    responses((status = 200, description = "Page metadata", body = super::EnvelopeDoc))
)]
pub async fn crawl_scrape_meta(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CrawlRequest>, JsonRejection>,
) -> Response {
    fetch(&state, "meta", payload).await
}

/// Breadth-first crawl of linked pages: title and the first 1000 characters of text each.
#[utoipa::path(
    post,
    path = "/crawl/scrape/deep",
    tag = "Crawl",
    request_body = DeepCrawlRequest,
    responses(
        (status = 200, description = "Pages crawled", body = super::EnvelopeDoc),
        (status = 400, description = "Not an http(s) URL or invalid page count", body = super::EnvelopeDoc),
        (status = 503, description = "At capacity", body = super::EnvelopeDoc),
        (status = 504, description = "Deadline exceeded before any page was fetched", body = super::EnvelopeDoc)
    )
)]
pub async fn crawl_scrape_deep(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeepCrawlRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let mut request = ToolRequest::new("deep").with_param("url", req.url);
    if let Some(max_pages) = req.max_pages {
        request = request.with_param("max_pages", max_pages);
    }
    if let Some(same_domain_only) = req.same_domain_only {
        request = request.with_param("same_domain_only", same_domain_only);
    }
    submit(&state, JobKind::Fetch, Box::new(request), false).await
}
