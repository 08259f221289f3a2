use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use convertd_core::{DeadlineHints, ErrorKind, JobError, JobId, JobKind};

use crate::process::{self, ProcessOutput, ToolCommand};

/// One staged invocation: which operation to run, on which files, with what options.
#[derive(Debug, Clone, Default)]
pub struct ToolRequest {
    /// Adapter-specific operation name (e.g. `image`, `trim`, `scrape`).
    pub operation: String,
    /// Staged input files, in submission order.
    pub inputs: Vec<PathBuf>,
    /// Operation options (form fields, already collected into JSON).
    pub params: Value,
}

impl ToolRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            inputs: Vec::new(),
            params: Value::Object(Default::default()),
        }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.params {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Numeric option; accepts JSON numbers and numeric strings (form fields arrive as text).
    pub fn f64_param(&self, key: &str) -> Result<Option<f64>, ToolError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| ToolError::InvalidInput(format!("'{key}' must be a number"))),
            Some(_) => Err(ToolError::InvalidInput(format!("'{key}' must be a number"))),
        }
    }

    pub fn u64_param(&self, key: &str) -> Result<Option<u64>, ToolError> {
        match self.f64_param(key)? {
            None => Ok(None),
            Some(v) if v >= 0.0 && v.fract() == 0.0 => Ok(Some(v as u64)),
            Some(_) => Err(ToolError::InvalidInput(format!(
                "'{key}' must be a non-negative integer"
            ))),
        }
    }

    pub fn bool_param(&self, key: &str) -> Result<Option<bool>, ToolError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(ToolError::InvalidInput(format!("'{key}' must be true or false"))),
            },
            Some(_) => Err(ToolError::InvalidInput(format!("'{key}' must be true or false"))),
        }
    }

    pub fn single_input(&self) -> Result<&Path, ToolError> {
        match self.inputs.as_slice() {
            [one] => Ok(one.as_path()),
            [] => Err(ToolError::InvalidInput("a file upload is required".to_string())),
            _ => Err(ToolError::InvalidInput(
                "exactly one file upload is expected".to_string(),
            )),
        }
    }
}

/// Everything an adapter may touch while running one job.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub job_id: JobId,
    /// Directory the adapter writes deliverable files into.
    pub output_dir: PathBuf,
    /// Scratch directory, removed with the job.
    pub temp_dir: PathBuf,
    /// The job's resolved deadline.
    pub deadline: Duration,
    /// Byte ceiling for the job's result (inline data plus files).
    pub max_output_bytes: u64,
    /// Cancelled on shutdown; running tools are killed when it fires.
    pub cancel: CancellationToken,
    started: Instant,
}

impl ToolContext {
    pub fn new(
        job_id: JobId,
        output_dir: PathBuf,
        temp_dir: PathBuf,
        deadline: Duration,
        max_output_bytes: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            output_dir,
            temp_dir,
            deadline,
            max_output_bytes,
            cancel,
            started: Instant::now(),
        }
    }

    /// Restart the deadline clock; called once the deadline has been resolved.
    pub fn start_clock(&mut self, deadline: Duration) {
        self.deadline = deadline;
        self.started = Instant::now();
    }

    /// Time left before the job's deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.started.elapsed())
    }

    /// Run an external command inside the job's remaining deadline.
    ///
    /// A multi-step adapter calls this several times; every step draws from the
    /// same budget and a timeout is reported against the job's full deadline.
    pub async fn run(&self, command: ToolCommand) -> Result<ProcessOutput, ToolError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(ToolError::Timeout(self.deadline));
        }
        match process::run(command, remaining, &self.cancel).await {
            Err(ToolError::Timeout(_)) => Err(ToolError::Timeout(self.deadline)),
            other => other,
        }
    }

    /// Path for a deliverable file with the given name.
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }
}

/// A deliverable file produced by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
    pub content_type: String,
}

impl OutputFile {
    /// Stat a file the tool wrote; a missing file means the tool misbehaved.
    pub async fn collect(path: PathBuf, content_type: &str) -> Result<Self, ToolError> {
        let meta = tokio::fs::metadata(&path).await.map_err(|_| {
            ToolError::ExecutionFailed("tool finished without producing output".to_string())
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        Ok(Self {
            name,
            path,
            size_bytes: meta.len(),
            content_type: content_type.to_string(),
        })
    }
}

/// Normalized result of a successful tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Kind-specific response payload.
    pub data: Value,
    pub files: Vec<OutputFile>,
}

impl ToolOutput {
    pub fn data(data: Value) -> Self {
        Self {
            data,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: OutputFile) -> Self {
        self.files.push(file);
        self
    }

    /// Bytes counted against the kind's output ceiling.
    pub fn total_bytes(&self) -> u64 {
        let inline = serde_json::to_vec(&self.data)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        inline + self.files.iter().map(|f| f.size_bytes).sum::<u64>()
    }
}

/// Presence and version of one external binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryStatus {
    pub name: String,
    pub found: bool,
    pub version: Option<String>,
}

/// Preflight report for one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatus {
    pub kind: JobKind,
    pub binaries: Vec<BinaryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolStatus {
    pub fn available(&self) -> bool {
        self.binaries.iter().all(|b| b.found)
    }

    pub fn missing(&self) -> Vec<&str> {
        self.binaries
            .iter()
            .filter(|b| !b.found)
            .map(|b| b.name.as_str())
            .collect()
    }
}

/// Uniform boundary over one kind's external tools.
///
/// Adapters are the only code that knows tool invocation syntax and how each
/// tool reports failure. Everything they return is normalized through
/// [`ToolError::kind`].
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Operation names accepted in [`ToolRequest::operation`].
    fn operations(&self) -> &'static [&'static str];

    /// Locate the adapter's binaries and report their versions.
    async fn check(&self) -> ToolStatus;

    /// Inspect staged inputs for facts the deadline depends on.
    ///
    /// Runs before the deadline is resolved; `ctx.deadline` holds the kind's
    /// ceiling. Failing to learn anything is not an error.
    async fn probe(
        &self,
        _request: &ToolRequest,
        _ctx: &ToolContext,
    ) -> Result<DeadlineHints, ToolError> {
        Ok(DeadlineHints::default())
    }

    /// Run the operation. Must not outlive `ctx.deadline` or ignore `ctx.cancel`.
    async fn invoke(&self, request: &ToolRequest, ctx: &ToolContext)
        -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unsupported format: {0}")]
    Unsupported(String),
    #[error("Input too large: {0}")]
    Oversized(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Terminated by shutdown")]
    Cancelled,
    #[error("Output too large: {0}")]
    OutputTooLarge(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::InvalidInput(_) => ErrorKind::InvalidParameters,
            ToolError::Unsupported(_) => ErrorKind::UnsupportedFormat,
            ToolError::Oversized(_) => ErrorKind::OversizedInput,
            ToolError::ExecutionFailed(_) | ToolError::Cancelled | ToolError::Other(_) => {
                ErrorKind::ToolCrashed
            }
            ToolError::Timeout(_) => ErrorKind::ToolTimeout,
            ToolError::OutputTooLarge(_) => ErrorKind::OutputTooLarge,
            ToolError::Io(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Collapse into the shared taxonomy with a caller-safe message.
    pub fn into_job_error(self, kind: JobKind) -> JobError {
        let error_kind = self.kind();
        let message = match self {
            ToolError::InvalidInput(m)
            | ToolError::Unsupported(m)
            | ToolError::Oversized(m)
            | ToolError::OutputTooLarge(m) => m,
            ToolError::ExecutionFailed(m) => format!("{kind} tool failed: {m}"),
            ToolError::Timeout(d) => {
                format!("{kind} job exceeded its {}s deadline", d.as_secs().max(1))
            }
            ToolError::Cancelled => "terminated by shutdown".to_string(),
            ToolError::Io(_) => "working storage is unavailable".to_string(),
            ToolError::Other(_) => format!("{kind} tool failed unexpectedly"),
        };
        JobError::new(error_kind, message)
    }
}

/// Lower-cased extension of `path`, if any.
pub fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Fail with `Unsupported` unless `path` has one of `allowed` extensions.
pub fn require_extension(path: &Path, allowed: &[&str], what: &str) -> Result<String, ToolError> {
    match extension(path) {
        Some(ext) if allowed.contains(&ext.as_str()) => Ok(ext),
        _ => Err(ToolError::Unsupported(format!(
            "{what} must be one of: {}",
            allowed.join(", ")
        ))),
    }
}

/// Content type for a produced file, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match extension(path).as_deref() {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mpeg") => "video/mpeg",
        Some("gif") => "image/gif",
        Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("aac") | Some("m4a") => "audio/aac",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "tif", "tiff", "bmp"];
pub const PDF_EXTENSIONS: &[&str] = &["pdf"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mpeg", "mov", "avi", "webm", "mkv"];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "flac"];
