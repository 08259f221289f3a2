//! PDF rendering: wkhtmltopdf for text and HTML, pandoc for markdown,
//! img2pdf for image sets, qpdf for merging.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use convertd_core::config::ToolsConfig;
use convertd_core::JobKind;

use crate::process::{probe_binary, ToolCommand};
use crate::tool::{
    require_extension, OutputFile, ToolAdapter, ToolContext, ToolError, ToolOutput,
    ToolRequest, ToolStatus, IMAGE_EXTENSIONS, PDF_EXTENSIONS,
};

const PAGE_SIZES: &[&str] = &["A3", "A4", "A5", "Letter", "Legal"];

pub struct RenderAdapter {
    pandoc: String,
    wkhtmltopdf: String,
    img2pdf: String,
    qpdf: String,
}

impl RenderAdapter {
    pub fn new(tools: &ToolsConfig) -> Self {
        Self {
            pandoc: tools.pandoc.clone(),
            wkhtmltopdf: tools.wkhtmltopdf.clone(),
            img2pdf: tools.img2pdf.clone(),
            qpdf: tools.qpdf.clone(),
        }
    }

    fn page_size(request: &ToolRequest) -> Result<&'static str, ToolError> {
        let wanted = request.str_param("page_size").unwrap_or("A4");
        PAGE_SIZES
            .iter()
            .find(|s| s.eq_ignore_ascii_case(wanted))
            .copied()
            .ok_or_else(|| {
                ToolError::InvalidInput(format!(
                    "page_size must be one of: {}",
                    PAGE_SIZES.join(", ")
                ))
            })
    }

    /// Inline source text from `field`, or the contents of a single uploaded file.
    async fn source_text(
        request: &ToolRequest,
        field: &str,
        allowed: &[&str],
    ) -> Result<String, ToolError> {
        if let Some(text) = request.params.get(field).and_then(|v| v.as_str()) {
            if !text.trim().is_empty() {
                return Ok(text.to_string());
            }
        }
        if request.inputs.is_empty() {
            return Err(ToolError::InvalidInput(format!(
                "provide '{field}' or upload a file"
            )));
        }
        let input = request.single_input()?;
        require_extension(input, allowed, "source file")?;
        let bytes = tokio::fs::read(input).await?;
        String::from_utf8(bytes)
            .map_err(|_| ToolError::Unsupported("source file must be UTF-8 text".to_string()))
    }

    fn wkhtmltopdf(&self, page_size: &str, html: &Path, out: &Path, ctx: &ToolContext) -> ToolCommand {
        ToolCommand::new(&self.wkhtmltopdf)
            .args(["--quiet", "--page-size", page_size])
            .arg("--disable-local-file-access")
            .arg("--allow")
            .arg(&ctx.temp_dir)
            .arg(html)
            .arg(out)
    }

    async fn from_text(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        let text = Self::source_text(req, "text", &["txt"]).await?;
        let font_size = req.u64_param("font_size")?.unwrap_or(11);
        if !(6..=36).contains(&font_size) {
            return Err(ToolError::InvalidInput(
                "font_size must be between 6 and 36".to_string(),
            ));
        }
        let html = format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><style>\
             body{{font-family:monospace;font-size:{font_size}pt}}\
             pre{{white-space:pre-wrap}}</style></head><body><pre>{}</pre></body></html>",
            escape_html(&text)
        );
        let source = ctx.temp_dir.join("source.html");
        tokio::fs::write(&source, html).await?;
        let out = ctx.output_path(&output_name(req));
        ctx.run(self.wkhtmltopdf(Self::page_size(req)?, &source, &out, ctx))
            .await?
            .check_success("wkhtmltopdf")?;
        Ok(out)
    }

    async fn from_html(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        let html = Self::source_text(req, "html", &["html", "htm"]).await?;
        let source = ctx.temp_dir.join("source.html");
        tokio::fs::write(&source, html).await?;
        let out = ctx.output_path(&output_name(req));
        ctx.run(self.wkhtmltopdf(Self::page_size(req)?, &source, &out, ctx))
            .await?
            .check_success("wkhtmltopdf")?;
        Ok(out)
    }

    async fn from_markdown(
        &self,
        req: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<PathBuf, ToolError> {
        let markdown = Self::source_text(req, "markdown", &["md", "markdown", "txt"]).await?;
        let source = ctx.temp_dir.join("source.md");
        tokio::fs::write(&source, markdown).await?;
        let out = ctx.output_path(&output_name(req));
        let page_size = Self::page_size(req)?;
        let cmd = ToolCommand::new(&self.pandoc)
            .args(["-f", "markdown", "-t", "html5", "--standalone"])
            .arg(format!("--pdf-engine={}", self.wkhtmltopdf))
            .arg("--pdf-engine-opt=--page-size")
            .arg(format!("--pdf-engine-opt={page_size}"))
            .arg("-o")
            .arg(&out)
            .arg(&source)
            .current_dir(&ctx.temp_dir);
        ctx.run(cmd).await?.check_success("pandoc")?;
        Ok(out)
    }

    async fn from_images(
        &self,
        req: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<PathBuf, ToolError> {
        if req.inputs.is_empty() {
            return Err(ToolError::InvalidInput(
                "at least one image is required".to_string(),
            ));
        }
        for input in &req.inputs {
            require_extension(input, IMAGE_EXTENSIONS, "image")?;
        }
        let out = ctx.output_path(&output_name(req));
        let cmd = ToolCommand::new(&self.img2pdf)
            .args(req.inputs.iter().cloned())
            .arg("-o")
            .arg(&out);
        ctx.run(cmd).await?.check_success("img2pdf")?;
        Ok(out)
    }

    async fn merge(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        if req.inputs.len() < 2 {
            return Err(ToolError::InvalidInput(
                "at least two PDF files are required to merge".to_string(),
            ));
        }
        for input in &req.inputs {
            require_extension(input, PDF_EXTENSIONS, "document")?;
        }
        let out = ctx.output_path(&output_name(req));
        let cmd = ToolCommand::new(&self.qpdf)
            .args(["--empty", "--pages"])
            .args(req.inputs.iter().cloned())
            .arg("--")
            .arg(&out);
        ctx.run(cmd).await?.check_success("qpdf")?;
        Ok(out)
    }
}

#[async_trait]
impl ToolAdapter for RenderAdapter {
    fn kind(&self) -> JobKind {
        JobKind::Render
    }

    fn operations(&self) -> &'static [&'static str] {
        &["from-text", "from-html", "from-markdown", "from-images", "merge"]
    }

    async fn check(&self) -> ToolStatus {
        ToolStatus {
            kind: JobKind::Render,
            binaries: vec![
                probe_binary("pandoc", &self.pandoc, "--version").await,
                probe_binary("wkhtmltopdf", &self.wkhtmltopdf, "--version").await,
                probe_binary("img2pdf", &self.img2pdf, "--version").await,
                probe_binary("qpdf", &self.qpdf, "--version").await,
            ],
            details: None,
        }
    }

    async fn invoke(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let out = match request.operation.as_str() {
            "from-text" => self.from_text(request, ctx).await?,
            "from-html" => self.from_html(request, ctx).await?,
            "from-markdown" => self.from_markdown(request, ctx).await?,
            "from-images" => self.from_images(request, ctx).await?,
            "merge" => self.merge(request, ctx).await?,
            other => {
                return Err(ToolError::InvalidInput(format!(
                    "unknown render operation '{other}'"
                )))
            }
        };
        let file = OutputFile::collect(out, "application/pdf").await?;
        Ok(ToolOutput::data(json!({
            "filename": file.name,
            "size_bytes": file.size_bytes,
            "source_files": request.inputs.len(),
        }))
        .with_file(file))
    }
}

/// Caller-chosen output name reduced to a safe `*.pdf` basename.
fn output_name(request: &ToolRequest) -> String {
    let raw = request.str_param("filename").unwrap_or("document");
    let stem: String = raw
        .trim_end_matches(".pdf")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .take(64)
        .collect();
    if stem.is_empty() {
        "document.pdf".to_string()
    } else {
        format!("{stem}.pdf")
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
