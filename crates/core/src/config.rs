use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::JobKind;
use crate::limits::{DeadlinePolicy, KindLimits, LimitsTable};

const MB: u64 = 1024 * 1024;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub admission: AdmissionConfig,
    pub limits: LimitsTable,
    pub ocr: OcrConfig,
    pub transcode: TranscodeConfig,
    pub fetch: FetchConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CONVERTD_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CONVERTD_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let server = ServerConfig::from_env_profiled(p);
        Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            admission: AdmissionConfig::from_env_profiled(p, server.workers),
            limits: limits_from_env_profiled(p),
            ocr: OcrConfig::from_env_profiled(p),
            transcode: TranscodeConfig::from_env_profiled(p),
            fetch: FetchConfig::from_env_profiled(p),
            tools: ToolsConfig::from_env_profiled(p),
            server,
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:     {}:{} workers={}", self.server.host, self.server.port, self.server.workers);
        tracing::info!("  storage:    dir={} cleanup={}h every {}m",
            self.storage.storage_dir.display(),
            self.storage.cleanup_hours,
            self.storage.cleanup_interval_minutes);
        tracing::info!("  admission:  global={} per_kind={:?}", self.admission.global_max, self.admission.per_kind);
        for kind in JobKind::ALL {
            let l = self.limits.get(kind);
            tracing::info!(
                "  {:<10}  input<={}MB output<={}MB deadline<={}s",
                kind.as_str(),
                l.max_input_bytes / MB,
                l.max_output_bytes / MB,
                l.deadline.ceiling().as_secs()
            );
        }
        tracing::info!("  tools:      require={}", self.tools.require);
    }

    /// Return a redacted view safe for API responses (no filesystem paths).
    pub fn redacted_summary(&self) -> serde_json::Value {
        let limits: serde_json::Map<String, serde_json::Value> = JobKind::ALL
            .iter()
            .map(|kind| {
                let l = self.limits.get(*kind);
                (
                    kind.as_str().to_string(),
                    serde_json::json!({
                        "max_concurrency": self.admission.max_for(*kind),
                        "max_input_mb": l.max_input_bytes / MB,
                        "max_output_mb": l.max_output_bytes / MB,
                        "deadline": l.deadline,
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "profile": self.profile_label(),
            "workers": self.server.workers,
            "max_concurrent_requests": self.admission.global_max,
            "cleanup_hours": self.storage.cleanup_hours,
            "cleanup_interval_minutes": self.storage.cleanup_interval_minutes,
            "limits": limits,
            "ocr": { "default_language": self.ocr.default_lang, "dpi": self.ocr.dpi },
            "transcode": { "threads": self.transcode.threads, "preset": self.transcode.preset },
            "fetch": { "max_crawl_pages": self.fetch.max_crawl_pages },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Size of the execution pool bounding concurrent tool invocations.
    pub workers: usize,
    /// How long shutdown waits for running jobs before killing their tools.
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_parse(p, "PORT", 8000),
            workers: profiled_env_parse(p, "WORKERS", 2usize).max(1),
            shutdown_grace_secs: profiled_env_parse(p, "SHUTDOWN_GRACE_SECS", 30),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root holding `uploads/`, `outputs/`, and `temp/`.
    pub storage_dir: PathBuf,
    /// Janitor retention horizon.
    pub cleanup_hours: u64,
    /// Janitor tick interval.
    pub cleanup_interval_minutes: u64,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            storage_dir: PathBuf::from(profiled_env_or(p, "STORAGE_DIR", "storage")),
            cleanup_hours: profiled_env_parse(p, "CLEANUP_HOURS", 24),
            cleanup_interval_minutes: profiled_env_parse(p, "CLEANUP_INTERVAL_MINUTES", 60u64)
                .max(1),
        }
    }
}

// ── Admission ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Cap on concurrently running jobs across all kinds.
    pub global_max: usize,
    /// Per-kind caps; kinds not listed fall back to `global_max`.
    pub per_kind: BTreeMap<JobKind, usize>,
}

impl AdmissionConfig {
    fn from_env_profiled(p: &str, workers: usize) -> Self {
        let global_max = profiled_env_parse(p, "MAX_CONCURRENT_REQUESTS", 10usize);
        if global_max > workers {
            tracing::warn!(
                "MAX_CONCURRENT_REQUESTS={} exceeds WORKERS={}; clamping admission cap to the worker pool",
                global_max,
                workers
            );
        }
        let global_max = global_max.min(workers).max(1);
        let per_kind = JobKind::ALL
            .iter()
            .filter_map(|kind| {
                let key = format!("MAX_CONCURRENT_{}", kind.env_suffix());
                profiled_env_opt(p, &key)
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .map(|n| (*kind, n.min(global_max)))
            })
            .collect();
        Self {
            global_max,
            per_kind,
        }
    }

    pub fn max_for(&self, kind: JobKind) -> usize {
        self.per_kind.get(&kind).copied().unwrap_or(self.global_max)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_max: 2,
            per_kind: BTreeMap::new(),
        }
    }
}

// ── Limits ────────────────────────────────────────────────────

fn limits_from_env_profiled(p: &str) -> LimitsTable {
    let defaults = LimitsTable::default();
    let upload_mb: u64 = profiled_env_parse(p, "MAX_UPLOAD_SIZE", 100);

    let sizes = |kind: JobKind| -> (u64, u64) {
        let d = defaults.get(kind);
        let input_mb: u64 =
            profiled_env_parse(p, &format!("MAX_UPLOAD_SIZE_{}", kind.env_suffix()), upload_mb);
        let output_mb: u64 = profiled_env_parse(
            p,
            &format!("MAX_OUTPUT_SIZE_{}", kind.env_suffix()),
            d.max_output_bytes / MB,
        );
        (input_mb * MB, output_mb * MB)
    };

    let (ocr_in, ocr_out) = sizes(JobKind::Ocr);
    let (render_in, render_out) = sizes(JobKind::Render);
    let (transcode_in, transcode_out) = sizes(JobKind::Transcode);
    let (fetch_in, fetch_out) = sizes(JobKind::Fetch);

    LimitsTable {
        ocr: KindLimits {
            max_input_bytes: ocr_in,
            max_output_bytes: ocr_out,
            deadline: DeadlinePolicy::PerPage {
                base_secs: profiled_env_parse(p, "OCR_TIMEOUT_BASE", 15),
                per_page_secs: profiled_env_parse(p, "OCR_TIMEOUT_PER_PAGE", 5),
                ceiling_secs: profiled_env_parse(p, "OCR_TIMEOUT_CEILING", 1800),
                max_pages: profiled_env_parse(p, "MAX_PDF_PAGES", 500),
            },
        },
        render: KindLimits {
            max_input_bytes: render_in,
            max_output_bytes: render_out,
            deadline: DeadlinePolicy::Fixed {
                timeout_secs: profiled_env_parse(p, "RENDER_TIMEOUT", 120),
            },
        },
        transcode: KindLimits {
            max_input_bytes: transcode_in,
            max_output_bytes: transcode_out,
            deadline: DeadlinePolicy::MediaDuration {
                base_secs: profiled_env_parse(p, "TRANSCODE_TIMEOUT_BASE", 30),
                factor: profiled_env_parse(p, "TRANSCODE_TIMEOUT_FACTOR", 2.0),
                ceiling_secs: profiled_env_parse(p, "TRANSCODE_TIMEOUT_CEILING", 900),
                max_media_secs: profiled_env_parse(p, "MAX_VIDEO_DURATION", 600),
            },
        },
        fetch: KindLimits {
            max_input_bytes: fetch_in,
            max_output_bytes: profiled_env_parse(p, "MAX_CRAWL_BYTES", fetch_out),
            deadline: DeadlinePolicy::Fixed {
                timeout_secs: profiled_env_parse(p, "CRAWL_TIMEOUT", 60),
            },
        },
    }
}

// ── OCR ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    pub default_lang: String,
    pub dpi: u32,
}

impl OcrConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            default_lang: profiled_env_or(p, "TESSERACT_LANG", "eng"),
            dpi: profiled_env_parse(p, "OCR_DPI", 300),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            default_lang: "eng".to_string(),
            dpi: 300,
        }
    }
}

// ── Transcode ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    pub threads: u32,
    /// ultrafast, fast, medium, slow
    pub preset: String,
}

impl TranscodeConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            threads: profiled_env_parse(p, "FFMPEG_THREADS", 2),
            preset: profiled_env_or(p, "FFMPEG_PRESET", "medium"),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            preset: "medium".to_string(),
        }
    }
}

// ── Fetch ─────────────────────────────────────────────────────

const DEFAULT_MAX_CRAWL_PAGES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Most pages one deep crawl may visit.
    pub max_crawl_pages: usize,
}

impl FetchConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            user_agent: profiled_env_or(
                p,
                "CRAWL_USER_AGENT",
                "Mozilla/5.0 (compatible; convertd/0.1)",
            ),
            max_crawl_pages: profiled_env_parse(p, "MAX_CRAWL_PAGES", DEFAULT_MAX_CRAWL_PAGES).max(1),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (compatible; convertd/0.1)".to_string(),
            max_crawl_pages: DEFAULT_MAX_CRAWL_PAGES,
        }
    }
}

// ── External tool binaries ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub tesseract: String,
    pub pdftoppm: String,
    pub pdfinfo: String,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub pandoc: String,
    pub wkhtmltopdf: String,
    pub qpdf: String,
    pub img2pdf: String,
    /// Missing binaries abort startup when set.
    pub require: bool,
}

impl ToolsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            tesseract: profiled_env_or(p, "TESSERACT_BIN", "tesseract"),
            pdftoppm: profiled_env_or(p, "PDFTOPPM_BIN", "pdftoppm"),
            pdfinfo: profiled_env_or(p, "PDFINFO_BIN", "pdfinfo"),
            ffmpeg: profiled_env_or(p, "FFMPEG_BIN", "ffmpeg"),
            ffprobe: profiled_env_or(p, "FFPROBE_BIN", "ffprobe"),
            pandoc: profiled_env_or(p, "PANDOC_BIN", "pandoc"),
            wkhtmltopdf: profiled_env_or(p, "WKHTMLTOPDF_BIN", "wkhtmltopdf"),
            qpdf: profiled_env_or(p, "QPDF_BIN", "qpdf"),
            img2pdf: profiled_env_or(p, "IMG2PDF_BIN", "img2pdf"),
            require: profiled_env_bool(p, "REQUIRE_TOOLS", true),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tesseract: "tesseract".to_string(),
            pdftoppm: "pdftoppm".to_string(),
            pdfinfo: "pdfinfo".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            pandoc: "pandoc".to_string(),
            wkhtmltopdf: "wkhtmltopdf".to_string(),
            qpdf: "qpdf".to_string(),
            img2pdf: "img2pdf".to_string(),
            require: true,
        }
    }
}
