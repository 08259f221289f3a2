//! OpenAPI documentation aggregator.
//!
//! Collects all `#[utoipa::path]`-annotated handlers and `ToSchema`-derived
//! types into a single OpenAPI 3.1 spec, served via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "convertd API",
        version = "0.1.0",
        description = "Document and media conversion: OCR, PDF rendering, media transcoding, and page fetching, each run as a bounded job.",
    ),
    tags(
        (name = "System", description = "Liveness, limits and live counters, endpoint index, and recent jobs"),
        (name = "OCR", description = "Text recognition in images and PDFs"),
        (name = "PDF", description = "PDF rendering from text, HTML, Markdown, and images; PDF merging"),
        (name = "Media", description = "Audio and video probing and transcoding"),
        (name = "Crawl", description = "Web page fetching and extraction"),
        (name = "Files", description = "Download and deletion of retained job outputs"),
    ),
    paths(
        // System
        crate::api::health::root,
        crate::api::health::health,
        crate::api::health::info,
        crate::api::health::jobs_recent,
        // OCR
        crate::api::ocr::ocr_image,
        crate::api::ocr::ocr_pdf,
        crate::api::ocr::ocr_languages,
        // PDF
        crate::api::pdf::pdf_from_text,
        crate::api::pdf::pdf_from_html,
        crate::api::pdf::pdf_from_markdown,
        crate::api::pdf::pdf_from_images,
        crate::api::pdf::pdf_merge,
        // Media
        crate::api::ffmpeg::ffmpeg_operation,
        // Crawl
        crate::api::crawl::crawl_scrape,
        crate::api::crawl::crawl_scrape_html,
        crate::api::crawl::crawl_scrape_text,
        crate::api::crawl::crawl_scrape_meta,
        crate::api::crawl::crawl_scrape_deep,
        // Files
        crate::api::files::files_download,
        crate::api::files::files_delete,
    ),
    components(schemas(
        crate::api::EnvelopeDoc,
        crate::api::health::HealthResponse,
        crate::api::ocr::LanguagesResponse,
        crate::api::pdf::RenderOptions,
        crate::api::pdf::TextToPdfRequest,
        crate::api::pdf::HtmlToPdfRequest,
        crate::api::pdf::MarkdownToPdfRequest,
        crate::api::crawl::CrawlRequest,
        crate::api::crawl::DeepCrawlRequest,
    ))
)]
pub struct ApiDoc;
