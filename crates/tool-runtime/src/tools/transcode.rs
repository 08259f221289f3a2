//! Media operations over ffmpeg/ffprobe.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use convertd_core::config::{ToolsConfig, TranscodeConfig};
use convertd_core::{DeadlineHints, JobKind};

use crate::process::{probe_binary, run, ToolCommand};
use crate::tool::{
    content_type_for, extension, require_extension, OutputFile, ToolAdapter, ToolContext, ToolError, ToolOutput,
    ToolRequest, ToolStatus, AUDIO_EXTENSIONS, VIDEO_EXTENSIONS,
};

/// Upper bound on the duration probe that runs before the deadline is known.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const AUDIO_FORMATS: &[&str] = &["mp3", "wav", "ogg", "aac", "flac"];
const CONVERT_FORMATS: &[&str] = &[
    "mp4", "webm", "mkv", "mov", "avi", "gif", "mp3", "wav", "ogg", "flac",
];
const THUMBNAIL_FORMATS: &[&str] = &["jpg", "png"];

pub struct TranscodeAdapter {
    ffmpeg: String,
    ffprobe: String,
    threads: u32,
    preset: String,
}

impl TranscodeAdapter {
    pub fn new(tools: &ToolsConfig, transcode: &TranscodeConfig) -> Self {
        Self {
            ffmpeg: tools.ffmpeg.clone(),
            ffprobe: tools.ffprobe.clone(),
            threads: transcode.threads,
            preset: transcode.preset.clone(),
        }
    }

    fn media_input(request: &ToolRequest) -> Result<&Path, ToolError> {
        let input = request.single_input()?;
        media_extension(input)?;
        Ok(input)
    }

    /// Base ffmpeg invocation: overwrite, quiet, bounded threads.
    fn ffmpeg(&self) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-threads".to_string(), self.threads.to_string()])
    }

    async fn duration_of(&self, input: &Path, ctx: &ToolContext) -> Option<f64> {
        let cmd = ToolCommand::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input);
        let out = run(cmd, PROBE_TIMEOUT.min(ctx.deadline), &ctx.cancel)
            .await
            .ok()?
            .check_success("ffprobe")
            .ok()?;
        out.stdout_text()
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d >= 0.0)
    }

    async fn info(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let input = Self::media_input(req)?;
        let cmd = ToolCommand::new(&self.ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input);
        let out = ctx.run(cmd).await?.check_success("ffprobe")?;
        let probe: Value = serde_json::from_slice(&out.stdout).map_err(|_| {
            ToolError::Unsupported("file is not a recognizable media container".to_string())
        })?;
        Ok(ToolOutput::data(summarize_probe(&probe)))
    }

    async fn trim(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        let input = Self::media_input(req)?;
        let start = req.f64_param("start")?.unwrap_or(0.0);
        let end = req.f64_param("end")?;
        let length = match (req.f64_param("duration")?, end) {
            (Some(d), _) => d,
            (None, Some(e)) => e - start,
            (None, None) => {
                return Err(ToolError::InvalidInput(
                    "either 'end' or 'duration' is required".to_string(),
                ))
            }
        };
        if start < 0.0 || length <= 0.0 {
            return Err(ToolError::InvalidInput(
                "trim range must be positive and start at or after 0".to_string(),
            ));
        }
        let out = ctx.output_path(&format!("trimmed.{}", media_extension(input)?));
        let cmd = self
            .ffmpeg()
            .args(["-ss".to_string(), format!("{start:.3}")])
            .arg("-i")
            .arg(input)
            .args(["-t".to_string(), format!("{length:.3}")])
            .args(["-c", "copy"])
            .arg(&out);
        ctx.run(cmd).await?.check_success("ffmpeg")?;
        Ok(out)
    }

    async fn resize(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        let input = Self::media_input(req)?;
        let width = req.u64_param("width")?;
        let height = req.u64_param("height")?;
        let dim = |d: Option<u64>| -> Result<String, ToolError> {
            match d {
                None => Ok("-2".to_string()),
                Some(v) if (16..=7680).contains(&v) => Ok((v - v % 2).to_string()),
                Some(_) => Err(ToolError::InvalidInput(
                    "width and height must be between 16 and 7680".to_string(),
                )),
            }
        };
        if width.is_none() && height.is_none() {
            return Err(ToolError::InvalidInput(
                "width or height is required".to_string(),
            ));
        }
        let scale = format!("scale={}:{}", dim(width)?, dim(height)?);
        let out = ctx.output_path("resized.mp4");
        let cmd = self
            .ffmpeg()
            .arg("-i")
            .arg(input)
            .args(["-vf", scale.as_str(), "-preset", self.preset.as_str(), "-c:a", "copy"])
            .arg(&out);
        ctx.run(cmd).await?.check_success("ffmpeg")?;
        Ok(out)
    }

    async fn compress(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        let input = Self::media_input(req)?;
        let crf = req.u64_param("crf")?.unwrap_or(28);
        if !(18..=51).contains(&crf) {
            return Err(ToolError::InvalidInput(
                "crf must be between 18 and 51".to_string(),
            ));
        }
        let crf = crf.to_string();
        let out = ctx.output_path("compressed.mp4");
        let cmd = self
            .ffmpeg()
            .arg("-i")
            .arg(input)
            .args(["-vcodec", "libx264", "-crf", crf.as_str(), "-preset", self.preset.as_str()])
            .args(["-acodec", "aac", "-b:a", "128k"])
            .arg(&out);
        ctx.run(cmd).await?.check_success("ffmpeg")?;
        Ok(out)
    }

    async fn extract_audio(
        &self,
        req: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<PathBuf, ToolError> {
        let input = Self::media_input(req)?;
        let format = choose(req, "format", "mp3", AUDIO_FORMATS)?;
        let out = ctx.output_path(&format!("audio.{format}"));
        let cmd = self.ffmpeg().arg("-i").arg(input).arg("-vn").arg(&out);
        ctx.run(cmd).await?.check_success("ffmpeg")?;
        Ok(out)
    }

    async fn thumbnail(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        let input = Self::media_input(req)?;
        let at = req.f64_param("timestamp")?.unwrap_or(1.0);
        if at < 0.0 {
            return Err(ToolError::InvalidInput(
                "timestamp must not be negative".to_string(),
            ));
        }
        let format = choose(req, "format", "jpg", THUMBNAIL_FORMATS)?;
        let out = ctx.output_path(&format!("thumbnail.{format}"));
        let cmd = self
            .ffmpeg()
            .args(["-ss".to_string(), format!("{at:.3}")])
            .arg("-i")
            .arg(input)
            .args(["-frames:v", "1"])
            .arg(&out);
        ctx.run(cmd).await?.check_success("ffmpeg")?;
        Ok(out)
    }

    async fn convert(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        let input = Self::media_input(req)?;
        let format = req
            .str_param("format")
            .ok_or_else(|| ToolError::InvalidInput("'format' is required".to_string()))?
            .to_ascii_lowercase();
        if !CONVERT_FORMATS.contains(&format.as_str()) {
            return Err(ToolError::Unsupported(format!(
                "format must be one of: {}",
                CONVERT_FORMATS.join(", ")
            )));
        }
        let out = ctx.output_path(&format!("converted.{format}"));
        let cmd = self.ffmpeg().arg("-i").arg(input).arg(&out);
        ctx.run(cmd).await?.check_success("ffmpeg")?;
        Ok(out)
    }

    async fn merge(&self, req: &ToolRequest, ctx: &ToolContext) -> Result<PathBuf, ToolError> {
        if req.inputs.len() < 2 {
            return Err(ToolError::InvalidInput(
                "at least two videos are required to merge".to_string(),
            ));
        }
        let mut listing = String::new();
        for input in &req.inputs {
            require_extension(input, VIDEO_EXTENSIONS, "video")?;
            // concat demuxer quoting: single quotes, embedded quotes escaped
            let escaped = input.to_string_lossy().replace('\'', "'\\''");
            listing.push_str(&format!("file '{escaped}'\n"));
        }
        let list = ctx.temp_dir.join("concat.txt");
        tokio::fs::write(&list, listing).await?;
        let out = ctx.output_path("merged.mp4");
        let cmd = self
            .ffmpeg()
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list)
            .args(["-c", "copy"])
            .arg(&out);
        ctx.run(cmd).await?.check_success("ffmpeg")?;
        Ok(out)
    }
}

#[async_trait]
impl ToolAdapter for TranscodeAdapter {
    fn kind(&self) -> JobKind {
        JobKind::Transcode
    }

    fn operations(&self) -> &'static [&'static str] {
        &[
            "info",
            "trim",
            "resize",
            "compress",
            "extract-audio",
            "thumbnail",
            "convert",
            "merge",
        ]
    }

    async fn check(&self) -> ToolStatus {
        ToolStatus {
            kind: JobKind::Transcode,
            binaries: vec![
                probe_binary("ffmpeg", &self.ffmpeg, "-version").await,
                probe_binary("ffprobe", &self.ffprobe, "-version").await,
            ],
            details: Some(json!({ "threads": self.threads, "preset": self.preset })),
        }
    }

    async fn probe(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<DeadlineHints, ToolError> {
        if request.inputs.is_empty() {
            return Ok(DeadlineHints::default());
        }
        let mut total = 0.0;
        for input in &request.inputs {
            media_extension(input)?;
            match self.duration_of(input, ctx).await {
                Some(d) => total += d,
                None => {
                    debug!(job_id = %ctx.job_id, "media duration unknown");
                    return Ok(DeadlineHints::default());
                }
            }
        }
        Ok(DeadlineHints::media(total))
    }

    async fn invoke(
        &self,
        request: &ToolRequest,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let out = match request.operation.as_str() {
            "info" => return self.info(request, ctx).await,
            "trim" => self.trim(request, ctx).await?,
            "resize" => self.resize(request, ctx).await?,
            "compress" => self.compress(request, ctx).await?,
            "extract-audio" => self.extract_audio(request, ctx).await?,
            "thumbnail" => self.thumbnail(request, ctx).await?,
            "convert" => self.convert(request, ctx).await?,
            "merge" => self.merge(request, ctx).await?,
            other => {
                return Err(ToolError::InvalidInput(format!(
                    "unknown transcode operation '{other}'"
                )))
            }
        };
        let content_type = content_type_for(&out);
        let file = OutputFile::collect(out, content_type).await?;
        Ok(ToolOutput::data(json!({
            "filename": file.name,
            "size_bytes": file.size_bytes,
            "operation": request.operation,
        }))
        .with_file(file))
    }
}

fn media_extension(path: &Path) -> Result<String, ToolError> {
    match extension(path) {
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) || AUDIO_EXTENSIONS.contains(&ext.as_str()) => {
            Ok(ext)
        }
        _ => Err(ToolError::Unsupported(format!(
            "media must be one of: {}, {}",
            VIDEO_EXTENSIONS.join(", "),
            AUDIO_EXTENSIONS.join(", ")
        ))),
    }
}

fn choose(
    req: &ToolRequest,
    key: &str,
    default: &str,
    allowed: &[&str],
) -> Result<String, ToolError> {
    let value = req.str_param(key).unwrap_or(default).to_ascii_lowercase();
    if allowed.contains(&value.as_str()) {
        Ok(value)
    } else {
        Err(ToolError::InvalidInput(format!(
            "{key} must be one of: {}",
            allowed.join(", ")
        )))
    }
}

/// Reduce `ffprobe -print_format json` output to the fields callers care about.
fn summarize_probe(probe: &Value) -> Value {
    let format = &probe["format"];
    let number = |v: &Value| -> Value {
        v.as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .map(Value::from)
            .unwrap_or(Value::Null)
    };
    let streams: Vec<Value> = probe["streams"]
        .as_array()
        .map(|streams| {
            streams
                .iter()
                .map(|s| {
                    json!({
                        "index": s["index"],
                        "codec_type": s["codec_type"],
                        "codec_name": s["codec_name"],
                        "width": s.get("width"),
                        "height": s.get("height"),
                        "frame_rate": s.get("r_frame_rate"),
                        "sample_rate": s.get("sample_rate"),
                        "channels": s.get("channels"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({
        "format": format["format_name"],
        "duration": number(&format["duration"]),
        "size_bytes": number(&format["size"]),
        "bit_rate": number(&format["bit_rate"]),
        "streams": streams,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tools::test_support::{context, stub};
    use convertd_core::ErrorKind;

    const FFPROBE: &str = r#"case "$*" in
  *format=duration*) echo "42.5";;
  *print_format*) echo '{"format":{"format_name":"mov,mp4","duration":"42.500","size":"1024","bit_rate":"800"},"streams":[{"index":0,"codec_type":"video","codec_name":"h264","width":640,"height":480}]}';;
  *) echo "ffprobe version 6.0";;
esac"#;

    /// Writes its last argument, records the full command line next to it.
    const FFMPEG: &str = r#"for last; do :; done
case "$last" in -version) echo "ffmpeg version 6.0"; exit 0;; esac
echo "$*" > "$last.args"
printf 'media' > "$last""#;

    fn adapter(dir: &Path) -> TranscodeAdapter {
        let tools = ToolsConfig {
            ffmpeg: stub(dir, "ffmpeg", FFMPEG),
            ffprobe: stub(dir, "ffprobe", FFPROBE),
            ..ToolsConfig::default()
        };
        TranscodeAdapter::new(&tools, &TranscodeConfig::default())
    }

    #[tokio::test]
    async fn probe_reports_duration() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 10);
        let req = ToolRequest::new("trim").with_input(dir.path().join("clip.mp4"));
        let hints = adapter(dir.path()).probe(&req, &ctx).await.unwrap();
        assert_eq!(hints, DeadlineHints::media(42.5));
    }

    #[tokio::test]
    async fn probe_sums_merge_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 10);
        let req = ToolRequest::new("merge")
            .with_input(dir.path().join("a.mp4"))
            .with_input(dir.path().join("b.mp4"));
        let hints = adapter(dir.path()).probe(&req, &ctx).await.unwrap();
        assert_eq!(hints, DeadlineHints::media(85.0));
    }

    #[tokio::test]
    async fn info_summarizes_probe_json() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 10);
        let req = ToolRequest::new("info").with_input(dir.path().join("clip.mp4"));
        let out = adapter(dir.path()).invoke(&req, &ctx).await.unwrap();
        assert!(out.files.is_empty());
        assert_eq!(out.data["duration"], 42.5);
        assert_eq!(out.data["streams"][0]["codec_name"], "h264");
    }

    #[tokio::test]
    async fn trim_uses_stream_copy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 10);
        let req = ToolRequest::new("trim")
            .with_input(dir.path().join("clip.mp4"))
            .with_param("start", "2")
            .with_param("end", "7.5");
        let out = adapter(dir.path()).invoke(&req, &ctx).await.unwrap();
        assert_eq!(out.files[0].name, "trimmed.mp4");
        assert_eq!(out.files[0].content_type, "video/mp4");
        let args = std::fs::read_to_string(ctx.output_dir.join("trimmed.mp4.args")).unwrap();
        assert!(args.contains("-ss 2.000"));
        assert!(args.contains("-t 5.500"));
        assert!(args.contains("-c copy"));
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 10);
        let a = adapter(dir.path());
        let clip = dir.path().join("clip.mp4");

        let no_end = ToolRequest::new("trim").with_input(&clip);
        assert_eq!(a.invoke(&no_end, &ctx).await.unwrap_err().kind(), ErrorKind::InvalidParameters);

        let bad_crf = ToolRequest::new("compress").with_input(&clip).with_param("crf", 5);
        assert_eq!(a.invoke(&bad_crf, &ctx).await.unwrap_err().kind(), ErrorKind::InvalidParameters);

        let bad_format = ToolRequest::new("convert").with_input(&clip).with_param("format", "exe");
        assert_eq!(a.invoke(&bad_format, &ctx).await.unwrap_err().kind(), ErrorKind::UnsupportedFormat);

        let not_media = ToolRequest::new("info").with_input(dir.path().join("doc.pdf"));
        assert_eq!(a.invoke(&not_media, &ctx).await.unwrap_err().kind(), ErrorKind::UnsupportedFormat);
    }

    #[tokio::test]
    async fn extract_audio_picks_format() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 10);
        let req = ToolRequest::new("extract-audio")
            .with_input(dir.path().join("clip.mov"))
            .with_param("format", "wav");
        let out = adapter(dir.path()).invoke(&req, &ctx).await.unwrap();
        assert_eq!(out.files[0].name, "audio.wav");
        assert_eq!(out.files[0].content_type, "audio/wav");
    }

    #[tokio::test]
    async fn merge_writes_concat_listing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), 10);
        let req = ToolRequest::new("merge")
            .with_input(dir.path().join("a.mp4"))
            .with_input(dir.path().join("it's.mp4"));
        adapter(dir.path()).invoke(&req, &ctx).await.unwrap();
        let listing = std::fs::read_to_string(ctx.temp_dir.join("concat.txt")).unwrap();
        assert_eq!(listing.lines().count(), 2);
        assert!(listing.contains(r"it'\''s.mp4"));
    }
}
