//! Page fetching over HTTP with a streaming byte ceiling.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde_json::{json, Value};
use tracing::debug;

use convertd_core::config::FetchConfig;
use convertd_core::JobKind;

use crate::tool::{BinaryStatus, ToolAdapter, ToolContext, ToolError, ToolOutput, ToolRequest, ToolStatus};

static RE_DROP_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|template)\b[^>]*>.*?</(script|style|noscript|template)>")
        .unwrap()
});
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f\v]+").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());
static RE_TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static RE_META: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\s[^>]*>").unwrap());
static RE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)([a-z:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());
static RE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

/// Characters of text kept per page in a deep crawl.
const DEEP_TEXT_CHARS: usize = 1000;
const DEFAULT_DEEP_PAGES: u64 = 10;

pub struct FetchAdapter {
    client: reqwest::Client,
    max_crawl_pages: usize,
}

struct FetchedPage {
    status: u16,
    final_url: String,
    content_type: Option<String>,
    body: String,
}

impl FetchAdapter {
    pub fn new(config: &FetchConfig) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ToolError::Other(e.into()))?;
        Ok(Self {
            client,
            max_crawl_pages: config.max_crawl_pages.max(1),
        })
    }

    fn target(request: &ToolRequest) -> Result<Url, ToolError> {
        let raw = request
            .str_param("url")
            .ok_or_else(|| ToolError::InvalidInput("'url' is required".to_string()))?;
        let url = Url::parse(raw)
            .map_err(|_| ToolError::InvalidInput(format!("'{raw}' is not a valid URL")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ToolError::Unsupported(format!(
                "only http and https URLs can be fetched, not {other}"
            ))),
        }
    }

    /// Page budget for a deep crawl: the requested count, capped by config.
    fn crawl_budget(&self, request: &ToolRequest) -> Result<usize, ToolError> {
        let requested = request.u64_param("max_pages")?.unwrap_or(DEFAULT_DEEP_PAGES);
        if requested == 0 {
            return Err(ToolError::InvalidInput("'max_pages' must be at least 1".to_string()));
        }
        Ok(usize::try_from(requested).unwrap_or(usize::MAX).min(self.max_crawl_pages))
    }

    /// Breadth-first crawl from `start`, one page at a time.
    ///
    /// Unreachable pages after the first are skipped. When the deadline runs
    /// out mid-crawl the pages gathered so far are returned with `truncated`.
    async fn crawl(
        &self,
        mut start: Url,
        max_pages: usize,
        same_domain_only: bool,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        start.set_fragment(None);
        let mut queue = VecDeque::from([start.clone()]);
        let mut seen = HashSet::from([start.to_string()]);
        let mut pages = Vec::new();
        let mut attempted = 0usize;
        let mut truncated = false;

        while let Some(next) = queue.pop_front() {
            if attempted >= max_pages {
                break;
            }
            attempted += 1;
            let fetched = tokio::select! {
                result = self.download(next.clone(), ctx.max_output_bytes) => Some(result),
                _ = tokio::time::sleep(ctx.remaining()) => None,
                _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            };
            let page = match fetched {
                Some(Ok(page)) => page,
                Some(Err(e)) if attempted == 1 => return Err(e),
                Some(Err(e)) => {
                    debug!(url = %next, error = %e, "deep crawl skipped page");
                    continue;
                }
                None if pages.is_empty() => return Err(ToolError::Timeout(ctx.deadline)),
                None => {
                    truncated = true;
                    break;
                }
            };

            let html = page.body.as_str();
            let base = Url::parse(&page.final_url).unwrap_or_else(|_| next.clone());
            pages.push(json!({
                "url": next.to_string(),
                "title": page_title(html),
                "text": page_text(html).chars().take(DEEP_TEXT_CHARS).collect::<String>(),
            }));
            for link in page_links(html, &base) {
                let Ok(mut link) = Url::parse(&link) else { continue };
                link.set_fragment(None);
                if same_domain_only && !same_site(&link, &start) {
                    continue;
                }
                if seen.insert(link.to_string()) {
                    queue.push_back(link);
                }
            }
        }

        Ok(json!({
            "start_url": start.to_string(),
            "pages_crawled": pages.len(),
            "pages": pages,
            "truncated": truncated,
        }))
    }

    /// Download `url`, refusing bodies above `limit` bytes without buffering them.
    async fn download(&self, url: Url, limit: u64) -> Result<FetchedPage, ToolError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            let reason = if e.is_connect() {
                "could not connect"
            } else if e.is_redirect() {
                "too many redirects"
            } else {
                "request failed"
            };
            ToolError::ExecutionFailed(format!("fetch {reason}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "remote server answered {}",
                status.as_u16()
            )));
        }
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(ToolError::OutputTooLarge(format!(
                "page exceeds the {} byte limit",
                limit
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().to_string();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|_| ToolError::ExecutionFailed("connection dropped".to_string()))?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(ToolError::OutputTooLarge(format!(
                    "page exceeds the {} byte limit",
                    limit
                )));
            }
            body.extend_from_slice(&chunk);
        }
        debug!(url = %final_url, bytes = body.len(), "page fetched");
        Ok(FetchedPage {
            status: status.as_u16(),
            final_url,
            content_type,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

#[async_trait]
impl ToolAdapter for FetchAdapter {
    fn kind(&self) -> JobKind {
        JobKind::Fetch
    }

    fn operations(&self) -> &'static [&'static str] {
        &["scrape", "html", "text", "meta", "deep"]
    }

    async fn check(&self) -> ToolStatus {
        // In-process HTTP client; nothing external to locate.
        ToolStatus {
            kind: JobKind::Fetch,
            binaries: vec![BinaryStatus {
                name: "http-client".to_string(),
                found: true,
                version: Some(format!("convertd/{}", env!("CARGO_PKG_VERSION"))),
            }],
            details: None,
        }
    }

    async fn invoke(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let operation = request.operation.as_str();
        if !self.operations().contains(&operation) {
            return Err(ToolError::InvalidInput(format!(
                "unknown fetch operation '{operation}'"
            )));
        }
        let url = Self::target(request)?;
        if operation == "deep" {
            let max_pages = self.crawl_budget(request)?;
            let same_domain_only = request.bool_param("same_domain_only")?.unwrap_or(true);
            return self
                .crawl(url, max_pages, same_domain_only, ctx)
                .await
                .map(ToolOutput::data);
        }
        let remaining = ctx.remaining();

        let page = tokio::select! {
            result = self.download(url.clone(), ctx.max_output_bytes) => result?,
            _ = tokio::time::sleep(remaining) => return Err(ToolError::Timeout(ctx.deadline)),
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };
        let html = page.body.as_str();

        let mut data = match operation {
            "html" => json!({ "html": html }),
            "text" => json!({ "text": page_text(html) }),
            "meta" => json!({ "meta": page_meta(html) }),
            _ => {
                let text = page_text(html);
                let base = Url::parse(&page.final_url).unwrap_or_else(|_| url.clone());
                json!({
                    "title": page_title(html),
                    "text": text,
                    "word_count": text.split_whitespace().count(),
                    "links": page_links(html, &base).len(),
                })
            }
        };
        if let Value::Object(map) = &mut data {
            map.insert("url".to_string(), Value::String(url.to_string()));
            map.insert("final_url".to_string(), Value::String(page.final_url));
            map.insert("status".to_string(), Value::from(page.status));
            map.insert("content_type".to_string(), json!(page.content_type));
        }
        Ok(ToolOutput::data(data))
    }
}

fn same_site(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Visible text with scripts and styles removed and whitespace collapsed.
pub fn page_text(html: &str) -> String {
    let without_blocks = RE_DROP_BLOCKS.replace_all(html, " ");
    let with_breaks = without_blocks
        .replace("</p>", "\n")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n");
    let stripped = RE_TAGS.replace_all(&with_breaks, " ");
    let decoded = decode_entities(&stripped);
    let collapsed = RE_WHITESPACE.replace_all(&decoded, " ");
    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    RE_BLANK_LINES
        .replace_all(&lines.join("\n"), "\n")
        .trim()
        .to_string()
}

pub fn page_title(html: &str) -> Option<String> {
    RE_TITLE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str().trim()))
        .filter(|t| !t.is_empty())
}

/// `<title>`, description, keywords, and every `og:`/`twitter:` property.
pub fn page_meta(html: &str) -> Value {
    let mut meta = serde_json::Map::new();
    if let Some(title) = page_title(html) {
        meta.insert("title".to_string(), Value::String(title));
    }
    for tag in RE_META.find_iter(html) {
        let mut key = None;
        let mut content = None;
        for attr in RE_ATTR.captures_iter(tag.as_str()) {
            let name = attr[1].to_ascii_lowercase();
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            match name.as_str() {
                "name" | "property" => key = Some(value.to_ascii_lowercase()),
                "content" => content = Some(value),
                _ => {}
            }
        }
        if let (Some(key), Some(content)) = (key, content) {
            let wanted = matches!(key.as_str(), "description" | "keywords" | "author")
                || key.starts_with("og:")
                || key.starts_with("twitter:");
            if wanted {
                meta.entry(key)
                    .or_insert_with(|| Value::String(decode_entities(&content)));
            }
        }
    }
    Value::Object(meta)
}

/// Absolute http(s) links on the page, deduplicated in document order.
pub fn page_links(html: &str, base: &Url) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for cap in RE_LINK.captures_iter(html) {
        let href = cap.get(1).or_else(|| cap.get(2)).map(|m| m.as_str()).unwrap_or("");
        if let Ok(resolved) = base.join(href.trim()) {
            if matches!(resolved.scheme(), "http" | "https") {
                let s = resolved.to_string();
                if !links.contains(&s) {
                    links.push(s);
                }
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use convertd_core::ErrorKind;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"<!DOCTYPE html><html><head>
<title>Example &amp; Co</title>
<meta name="description" content="A test page">
<meta property="og:title" content='OG Example'>
<style>body { color: red }</style>
<script>var hidden = "not text";</script>
</head><body>
<h1>Hello</h1><p>First paragraph.</p>
<a href="/about">About</a> <a href="https://other.example/x">X</a> <a href="mailto:a@b.c">mail</a>
<a href="/about">About again</a>
</body></html>"#;

    fn ctx(limit: u64, deadline: Duration) -> ToolContext {
        ToolContext::new(
            Uuid::new_v4(),
            PathBuf::from("/nonexistent/out"),
            PathBuf::from("/nonexistent/tmp"),
            deadline,
            limit,
            CancellationToken::new(),
        )
    }

    fn adapter() -> FetchAdapter {
        FetchAdapter::new(&FetchConfig::default()).unwrap()
    }

    async fn serve(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn text_extraction_drops_scripts_and_styles() {
        let text = page_text(PAGE);
        assert!(text.contains("Hello"));
        assert!(text.contains("First paragraph."));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("color"));
    }

    #[test]
    fn meta_extraction() {
        let meta = page_meta(PAGE);
        assert_eq!(meta["title"], "Example & Co");
        assert_eq!(meta["description"], "A test page");
        assert_eq!(meta["og:title"], "OG Example");
    }

    #[test]
    fn links_are_resolved_and_deduplicated() {
        let base = Url::parse("https://site.example/dir/").unwrap();
        let links = page_links(PAGE, &base);
        assert_eq!(
            links,
            vec!["https://site.example/about", "https://other.example/x"]
        );
    }

    #[tokio::test]
    async fn scrape_summarizes_page() {
        let server = serve(PAGE).await;
        let req = ToolRequest::new("scrape").with_param("url", format!("{}/page", server.uri()));
        let out = adapter()
            .invoke(&req, &ctx(1024 * 1024, Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.data["title"], "Example & Co");
        assert_eq!(out.data["status"], 200);
        assert_eq!(out.data["links"], 2);
    }

    #[tokio::test]
    async fn body_over_ceiling_is_output_too_large() {
        let server = serve(&"x".repeat(10_000)).await;
        let req = ToolRequest::new("html").with_param("url", format!("{}/page", server.uri()));
        let err = adapter()
            .invoke(&req, &ctx(1_000, Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutputTooLarge);
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let req = ToolRequest::new("text").with_param("url", format!("{}/page", server.uri()));
        let err = adapter()
            .invoke(&req, &ctx(1024, Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolTimeout);
    }

    #[tokio::test]
    async fn upstream_error_status_is_crash() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let req = ToolRequest::new("meta").with_param("url", format!("{}/gone", server.uri()));
        let err = adapter()
            .invoke(&req, &ctx(1024, Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolCrashed);
        assert!(err.to_string().contains("404"));
    }

    async fn mount(server: &MockServer, at: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    async fn small_site() -> MockServer {
        let server = MockServer::start().await;
        mount(
            &server,
            "/",
            r#"<title>Home</title><a href="/a">A</a> <a href="/b#top">B</a> <a href="https://other.example/x">X</a>"#,
        )
        .await;
        mount(&server, "/a", r#"<title>A</title><p>Page A</p><a href="/">home</a><a href="/c">C</a>"#).await;
        mount(&server, "/b", &format!("<title>B</title><p>{}</p>", "b".repeat(3000))).await;
        mount(&server, "/c", "<title>C</title>").await;
        server
    }

    fn deep(server: &MockServer) -> ToolRequest {
        ToolRequest::new("deep").with_param("url", format!("{}/", server.uri()))
    }

    #[tokio::test]
    async fn deep_crawl_walks_internal_links_breadth_first() {
        let server = small_site().await;
        let out = adapter()
            .invoke(&deep(&server), &ctx(1024 * 1024, Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.data["pages_crawled"], 4);
        let titles: Vec<&str> = out.data["pages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["Home", "A", "B", "C"]);
        assert_eq!(out.data["pages"][2]["text"].as_str().unwrap().chars().count(), 1000);
        assert_eq!(out.data["truncated"], false);
    }

    #[tokio::test]
    async fn deep_crawl_respects_requested_and_configured_caps() {
        let server = small_site().await;
        let c = ctx(1024 * 1024, Duration::from_secs(10));
        let out = adapter()
            .invoke(&deep(&server).with_param("max_pages", 2), &c)
            .await
            .unwrap();
        assert_eq!(out.data["pages_crawled"], 2);

        let capped = FetchAdapter::new(&FetchConfig {
            max_crawl_pages: 3,
            ..FetchConfig::default()
        })
        .unwrap();
        let out = capped
            .invoke(&deep(&server).with_param("max_pages", 50), &c)
            .await
            .unwrap();
        assert_eq!(out.data["pages_crawled"], 3);

        let err = adapter()
            .invoke(&deep(&server).with_param("max_pages", 0), &c)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    }

    #[tokio::test]
    async fn deep_crawl_fails_when_start_page_does() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let err = adapter()
            .invoke(&deep(&server), &ctx(1024, Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolCrashed);
    }

    #[tokio::test]
    async fn only_http_urls() {
        let c = ctx(1024, Duration::from_secs(1));
        let file = ToolRequest::new("scrape").with_param("url", "file:///etc/passwd");
        assert_eq!(
            adapter().invoke(&file, &c).await.unwrap_err().kind(),
            ErrorKind::UnsupportedFormat
        );
        let junk = ToolRequest::new("scrape").with_param("url", "not a url");
        assert_eq!(
            adapter().invoke(&junk, &c).await.unwrap_err().kind(),
            ErrorKind::InvalidParameters
        );
    }
}
