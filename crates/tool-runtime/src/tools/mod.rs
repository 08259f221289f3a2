//! One adapter per job kind.
//!
//! - `ocr`: tesseract, with pdftoppm/pdfinfo for PDFs
//! - `render`: wkhtmltopdf, pandoc, img2pdf, qpdf
//! - `transcode`: ffmpeg/ffprobe
//! - `fetch`: in-process HTTP client

pub mod fetch;
pub mod ocr;
pub mod render;
pub mod transcode;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

pub use fetch::FetchAdapter;
pub use ocr::OcrAdapter;
pub use render::RenderAdapter;
pub use transcode::TranscodeAdapter;
