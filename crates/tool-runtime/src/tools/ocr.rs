//! OCR through tesseract, with poppler for PDF rasterising and page counting.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use convertd_core::config::{OcrConfig, ToolsConfig};
use convertd_core::{DeadlineHints, JobKind};

use crate::process::{probe_binary, ToolCommand};
use crate::tool::{
    require_extension, ToolAdapter, ToolContext, ToolError, ToolOutput, ToolRequest, ToolStatus,
    IMAGE_EXTENSIONS, PDF_EXTENSIONS,
};

/// `pdfinfo` should answer in well under this.
const PAGE_COUNT_TIMEOUT: Duration = Duration::from_secs(30);

/// `json` is tesseract's TSV parsed into word records.
const OUTPUT_FORMATS: &[&str] = &["text", "hocr", "tsv", "json"];

pub struct OcrAdapter {
    tesseract: String,
    pdftoppm: String,
    pdfinfo: String,
    default_lang: String,
    dpi: u32,
    /// Installed language packs, captured at preflight.
    languages: RwLock<Vec<String>>,
}

impl OcrAdapter {
    pub fn new(tools: &ToolsConfig, ocr: &OcrConfig) -> Self {
        Self {
            tesseract: tools.tesseract.clone(),
            pdftoppm: tools.pdftoppm.clone(),
            pdfinfo: tools.pdfinfo.clone(),
            default_lang: ocr.default_lang.clone(),
            dpi: ocr.dpi,
            languages: RwLock::new(Vec::new()),
        }
    }

    /// Languages reported by `tesseract --list-langs` at the last check.
    pub fn languages(&self) -> Vec<String> {
        self.languages.read().map(|l| l.clone()).unwrap_or_default()
    }

    fn language(&self, request: &ToolRequest) -> Result<String, ToolError> {
        let lang = request
            .str_param("language")
            .unwrap_or(&self.default_lang)
            .to_string();
        let known = self.languages();
        for part in lang.split('+') {
            let valid_name = !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid_name {
                return Err(ToolError::InvalidInput(format!(
                    "'{lang}' is not a valid language code"
                )));
            }
            // An empty list means preflight could not enumerate; let tesseract decide.
            if !known.is_empty() && !known.iter().any(|k| k == part) {
                return Err(ToolError::InvalidInput(format!(
                    "language '{part}' is not installed"
                )));
            }
        }
        Ok(lang)
    }

    /// Explicit page selection, e.g. `pages=1,3,5`.
    fn selected_pages(request: &ToolRequest) -> Result<Option<Vec<u32>>, ToolError> {
        let Some(raw) = request.params.get("pages") else {
            return Ok(None);
        };
        let items: Vec<String> = match raw {
            Value::Null => return Ok(None),
            Value::Array(items) => items.iter().map(|v| v.to_string()).collect(),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
            other => vec![other.to_string()],
        };
        let mut pages = Vec::with_capacity(items.len());
        for item in items {
            match item.trim_matches('"').parse::<u32>() {
                Ok(p) if p >= 1 => pages.push(p),
                _ => {
                    return Err(ToolError::InvalidInput(
                        "pages must be a comma-separated list of page numbers".to_string(),
                    ))
                }
            }
        }
        pages.sort_unstable();
        pages.dedup();
        Ok(Some(pages))
    }

    fn output_format(request: &ToolRequest) -> Result<&str, ToolError> {
        let format = request.str_param("output_format").unwrap_or("text");
        if !OUTPUT_FORMATS.contains(&format) {
            return Err(ToolError::InvalidInput(format!(
                "output_format must be one of: {}",
                OUTPUT_FORMATS.join(", ")
            )));
        }
        Ok(format)
    }

    /// Reject selected pages past the end of a document of `total` pages.
    fn check_selection(pages: &[u32], total: u32) -> Result<(), ToolError> {
        match pages.iter().find(|&&p| p > total) {
            Some(page) => Err(ToolError::InvalidInput(format!(
                "page {page} is past the end of the document ({total} pages)"
            ))),
            None => Ok(()),
        }
    }

    async fn count_pages(&self, pdf: &Path, ctx: &ToolContext) -> Option<u32> {
        let out = crate::process::run(
            ToolCommand::new(&self.pdfinfo).arg(pdf),
            PAGE_COUNT_TIMEOUT.min(ctx.deadline),
            &ctx.cancel,
        )
        .await
        .ok()?
        .check_success("pdfinfo")
        .ok()?;
        parse_pdfinfo_pages(&out.stdout_text())
    }

    async fn recognize(
        &self,
        image: &Path,
        lang: &str,
        format: &str,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let mut cmd = ToolCommand::new(&self.tesseract)
            .arg(image)
            .arg("stdout")
            .args(["-l", lang])
            .stdout_limit(ctx.max_output_bytes.saturating_add(1) as usize);
        if format != "text" {
            cmd = cmd.arg(format);
        }
        let out = ctx.run(cmd).await?.check_success("tesseract")?;
        if out.stdout_truncated {
            return Err(ToolError::OutputTooLarge(
                "recognized text exceeds the output limit".to_string(),
            ));
        }
        Ok(out.stdout_text())
    }

    /// One image in the requested format. `json` adds word records.
    async fn recognize_page(
        &self,
        image: &Path,
        lang: &str,
        format: &str,
        ctx: &ToolContext,
    ) -> Result<(String, Option<Value>), ToolError> {
        if format == "json" {
            let tsv = self.recognize(image, lang, "tsv", ctx).await?;
            let words = parse_tsv_words(&tsv);
            let text = words
                .iter()
                .filter_map(|w| w["text"].as_str())
                .collect::<Vec<_>>()
                .join(" ");
            return Ok((text, Some(Value::Array(words))));
        }
        let raw = self.recognize(image, lang, format, ctx).await?;
        Ok((raw.trim().to_string(), None))
    }

    async fn ocr_image(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let input = request.single_input()?;
        require_extension(input, IMAGE_EXTENSIONS, "image")?;
        let lang = self.language(request)?;
        let format = Self::output_format(request)?;

        let (text, words) = self.recognize_page(input, &lang, format, ctx).await?;
        let mut data = json!({
            "characters": text.chars().count(),
            "text": text,
            "format": format,
            "language": lang,
        });
        if let (Some(words), Value::Object(map)) = (words, &mut data) {
            map.insert("words".to_string(), words);
        }
        Ok(ToolOutput::data(data))
    }

    async fn ocr_pdf(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let input = request.single_input()?;
        require_extension(input, PDF_EXTENSIONS, "document")?;
        let lang = self.language(request)?;
        let format = Self::output_format(request)?;
        let dpi = request
            .u64_param("dpi")?
            .map(|d| d.clamp(72, 600) as u32)
            .unwrap_or(self.dpi);

        let pages_dir = ctx.temp_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;

        let rasterize = |first: Option<u32>, last: Option<u32>, prefix: PathBuf| {
            let mut cmd = ToolCommand::new(&self.pdftoppm)
                .args(["-r".to_string(), dpi.to_string(), "-png".to_string()]);
            if let Some(f) = first {
                cmd = cmd.args(["-f".to_string(), f.to_string()]);
            }
            if let Some(l) = last {
                cmd = cmd.args(["-l".to_string(), l.to_string()]);
            }
            cmd.arg(input).arg(prefix)
        };

        let mut images: Vec<(u32, PathBuf)> = Vec::new();
        match Self::selected_pages(request)? {
            Some(pages) => {
                if let Some(total) = self.count_pages(input, ctx).await {
                    Self::check_selection(&pages, total)?;
                }
                for page in pages {
                    let prefix = pages_dir.join(format!("sel-{page:05}"));
                    ctx.run(rasterize(Some(page), Some(page), prefix.clone()))
                        .await?
                        .check_success("pdftoppm")?;
                    let rendered = list_pngs(&pages_dir, &format!("sel-{page:05}")).await?;
                    match rendered.into_iter().next() {
                        Some(path) => images.push((page, path)),
                        None => {
                            return Err(ToolError::InvalidInput(format!(
                                "page {page} does not exist in the document"
                            )))
                        }
                    }
                }
            }
            None => {
                ctx.run(rasterize(None, None, pages_dir.join("page")))
                    .await?
                    .check_success("pdftoppm")?;
                images = list_pngs(&pages_dir, "page")
                    .await?
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| (i as u32 + 1, p))
                    .collect();
            }
        }
        if images.is_empty() {
            return Err(ToolError::ExecutionFailed(
                "document produced no pages".to_string(),
            ));
        }

        let mut pages = Vec::with_capacity(images.len());
        let mut full_text = String::new();
        for (page, image) in &images {
            let (text, words) = self.recognize_page(image, &lang, format, ctx).await?;
            debug!(job_id = %ctx.job_id, page = page, chars = text.len(), "page recognized");
            if !full_text.is_empty() {
                full_text.push_str("\n\n");
            }
            full_text.push_str(&text);
            if full_text.len() as u64 > ctx.max_output_bytes {
                return Err(ToolError::OutputTooLarge(
                    "recognized text exceeds the output limit".to_string(),
                ));
            }
            let mut entry = json!({ "page": page, "text": text });
            if let (Some(words), Value::Object(map)) = (words, &mut entry) {
                map.insert("words".to_string(), words);
            }
            pages.push(entry);
        }

        Ok(ToolOutput::data(json!({
            "text": full_text,
            "pages": pages,
            "total_pages": images.len(),
            "format": format,
            "language": lang,
            "dpi": dpi,
        })))
    }
}

#[async_trait]
impl ToolAdapter for OcrAdapter {
    fn kind(&self) -> JobKind {
        JobKind::Ocr
    }

    fn operations(&self) -> &'static [&'static str] {
        &["image", "pdf"]
    }

    async fn check(&self) -> ToolStatus {
        let binaries = vec![
            probe_binary("tesseract", &self.tesseract, "--version").await,
            probe_binary("pdftoppm", &self.pdftoppm, "-v").await,
            probe_binary("pdfinfo", &self.pdfinfo, "-v").await,
        ];

        let mut languages = Vec::new();
        if binaries[0].found {
            let listed = crate::process::run(
                ToolCommand::new(&self.tesseract).arg("--list-langs"),
                PAGE_COUNT_TIMEOUT,
                &Default::default(),
            )
            .await;
            if let Ok(out) = listed {
                // Older releases print the list on stderr.
                let text = if out.stdout.is_empty() {
                    String::from_utf8_lossy(&out.stderr).into_owned()
                } else {
                    out.stdout_text()
                };
                languages = parse_language_list(&text);
            }
            info!(count = languages.len(), "tesseract languages detected");
        }
        if let Ok(mut guard) = self.languages.write() {
            *guard = languages.clone();
        }

        ToolStatus {
            kind: JobKind::Ocr,
            binaries,
            details: Some(json!({
                "languages": languages,
                "default_language": self.default_lang,
            })),
        }
    }

    async fn probe(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<DeadlineHints, ToolError> {
        match request.operation.as_str() {
            "image" => Ok(DeadlineHints::pages(1)),
            "pdf" => {
                let selected = Self::selected_pages(request)?;
                let input = request.single_input()?;
                require_extension(input, PDF_EXTENSIONS, "document")?;
                let total = self.count_pages(input, ctx).await;
                match (selected, total) {
                    (Some(pages), Some(total)) => {
                        Self::check_selection(&pages, total)?;
                        Ok(DeadlineHints::pages(pages.len() as u32))
                    }
                    (Some(pages), None) => Ok(DeadlineHints::pages(pages.len() as u32)),
                    (None, Some(total)) => Ok(DeadlineHints::pages(total)),
                    (None, None) => Ok(DeadlineHints::default()),
                }
            }
            _ => Ok(DeadlineHints::default()),
        }
    }

    async fn invoke(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        match request.operation.as_str() {
            "image" => self.ocr_image(request, ctx).await,
            "pdf" => self.ocr_pdf(request, ctx).await,
            other => Err(ToolError::InvalidInput(format!(
                "unknown OCR operation '{other}'"
            ))),
        }
    }
}

async fn list_pngs(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, ToolError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) && name.ends_with(".png") {
            found.push(entry.path());
        }
    }
    // pdftoppm zero-pads page numbers to a fixed width, so name order is page order.
    found.sort();
    Ok(found)
}

fn parse_pdfinfo_pages(text: &str) -> Option<u32> {
    text.lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|n| n.trim().parse().ok())
}

/// Word rows (level 5) of tesseract's TSV output.
fn parse_tsv_words(tsv: &str) -> Vec<Value> {
    tsv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let text = cols[11].trim();
            if text.is_empty() {
                return None;
            }
            let num = |i: usize| cols[i].trim().parse::<i64>().unwrap_or(0);
            Some(json!({
                "text": text,
                "confidence": cols[10].trim().parse::<f64>().unwrap_or(-1.0),
                "block": num(2),
                "line": num(4),
                "left": num(6),
                "top": num(7),
                "width": num(8),
                "height": num(9),
            }))
        })
        .collect()
}

fn parse_language_list(text: &str) -> Vec<String> {
    let mut langs: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("List of") && !l.contains(' '))
        .map(str::to_string)
        .collect();
    langs.sort();
    langs
}
