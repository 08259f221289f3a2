//! Deadline-bounded subprocess execution.
//!
//! Tools run directly (no shell), in their own process group on Unix. When the
//! deadline passes or the job is cancelled the whole group is killed and the
//! child reaped before returning, so nothing keeps burning CPU after its job
//! has ended.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tool::{BinaryStatus, ToolError};

/// Default cap on captured stderr.
const STDERR_CAPTURE_BYTES: usize = 64 * 1024;
/// Default cap on captured stdout.
const STDOUT_CAPTURE_BYTES: usize = 1024 * 1024;
/// Version probes are cheap; anything slower is treated as missing.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A command line for one external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    stdout_limit: usize,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdout_limit: STDOUT_CAPTURE_BYTES,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Capture at most `limit` bytes of stdout; the rest is drained and dropped.
    pub fn stdout_limit(mut self, limit: usize) -> Self {
        self.stdout_limit = limit;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// What a finished tool left behind.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Fail with `ExecutionFailed` unless the tool exited zero.
    pub fn check_success(self, tool: &str) -> Result<Self, ToolError> {
        if self.status.success() {
            return Ok(self);
        }
        let code = self
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = stderr_tail(&self.stderr);
        Err(ToolError::ExecutionFailed(if tail.is_empty() {
            format!("{tool} exited with status {code}")
        } else {
            format!("{tool} exited with status {code}: {tail}")
        }))
    }
}

/// Last line of stderr, trimmed and with anything path-like scrubbed.
pub fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let last = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("");
    let scrubbed: Vec<&str> = last
        .split_whitespace()
        .map(|word| if word.contains('/') { "<path>" } else { word })
        .collect();
    let mut out = scrubbed.join(" ");
    if out.len() > 200 {
        let mut cut = 200;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

enum Finished {
    Exited(ExitStatus),
    Deadline,
    Cancelled,
}

/// Run `command` to completion, killing it at `deadline` or when `cancel` fires.
pub async fn run(
    command: ToolCommand,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ToolError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.cwd {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::ExecutionFailed(format!("{} is not installed", command.program))
        } else {
            ToolError::ExecutionFailed(format!("failed to start {}: {e}", command.program))
        }
    })?;
    let pid = child.id();

    debug!(
        program = %command.program,
        pid = ?pid,
        deadline_secs = deadline.as_secs_f64(),
        "spawned tool process"
    );

    let stdout = child.stdout.take().map(|out| {
        let limit = command.stdout_limit;
        tokio::spawn(async move { read_capped(out, limit).await })
    });
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(async move { read_capped(err, STDERR_CAPTURE_BYTES).await }));

    let finished = tokio::select! {
        status = child.wait() => Finished::Exited(status.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed waiting for {}: {e}", command.program))
        })?),
        _ = tokio::time::sleep(deadline) => Finished::Deadline,
        _ = cancel.cancelled() => Finished::Cancelled,
    };

    match finished {
        Finished::Exited(status) => {
            let (stdout, stdout_truncated) = match stdout {
                Some(handle) => handle.await.ok().and_then(Result::ok).unwrap_or_default(),
                None => Default::default(),
            };
            let (stderr, _) = match stderr {
                Some(handle) => handle.await.ok().and_then(Result::ok).unwrap_or_default(),
                None => Default::default(),
            };
            Ok(ProcessOutput {
                status,
                stdout,
                stdout_truncated,
                stderr,
            })
        }
        Finished::Deadline | Finished::Cancelled => {
            terminate(&mut child, pid).await;
            for handle in [stdout, stderr].into_iter().flatten() {
                handle.abort();
            }
            if matches!(finished, Finished::Deadline) {
                warn!(
                    program = %command.program,
                    pid = ?pid,
                    deadline_secs = deadline.as_secs_f64(),
                    "tool exceeded deadline, process group killed"
                );
                Err(ToolError::Timeout(deadline))
            } else {
                warn!(program = %command.program, pid = ?pid, "tool cancelled, process group killed");
                Err(ToolError::Cancelled)
            }
        }
    }
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // A negative pid addresses the group created at spawn.
        let _ = Command::new("kill")
            .args(["-KILL", "--", &format!("-{pid}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone");
    }
}

async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((buf, truncated))
}

/// Run `<binary> <flag>` and report whether it exists and what version it prints.
pub async fn probe_binary(name: &str, binary: &str, flag: &str) -> BinaryStatus {
    let result = run(
        ToolCommand::new(binary).arg(flag).stdout_limit(16 * 1024),
        VERSION_PROBE_TIMEOUT,
        &CancellationToken::new(),
    )
    .await;
    match result {
        Ok(out) => {
            // Some tools print their banner on stderr, some exit non-zero for -v.
            let text = if out.stdout.is_empty() {
                String::from_utf8_lossy(&out.stderr).into_owned()
            } else {
                out.stdout_text()
            };
            let version = text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string);
            BinaryStatus {
                name: name.to_string(),
                found: true,
                version,
            }
        }
        Err(e) => {
            debug!(tool = name, error = %e, "binary probe failed");
            BinaryStatus {
                name: name.to_string(),
                found: false,
                version: None,
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_output_and_status() {
        let out = run(sh("echo hello; echo oops >&2"), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout_text().trim(), "hello");
        assert_eq!(String::from_utf8_lossy(&out.stderr).trim(), "oops");
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_execution_failed() {
        let out = run(
            sh("echo 'cannot open /etc/secret/file' >&2; exit 3"),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let err = out.check_success("stub").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status 3"));
        assert!(!msg.contains("/etc"));
    }

    #[tokio::test]
    async fn deadline_kills_and_reaps_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 10", pid_file.display());

        let started = Instant::now();
        let err = run(sh(&script), Duration::from_millis(300), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let alive = std::process::Command::new("kill")
            .args(["-0", pid.trim()])
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!alive.success(), "tool process survived its deadline");
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = run(sh("sleep 10"), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn stdout_is_capped() {
        let out = run(
            sh("head -c 5000 /dev/zero").stdout_limit(1000),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.len(), 1000);
        assert!(out.stdout_truncated);
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let err = run(
            ToolCommand::new("definitely-not-a-real-tool-xyz"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not installed"));

        let status = probe_binary("ghost", "definitely-not-a-real-tool-xyz", "--version").await;
        assert!(!status.found);
    }

    #[tokio::test]
    async fn probe_reads_first_banner_line() {
        let status = probe_binary("sh", "sh", "-c").await;
        // `sh -c` with no script fails but the binary exists.
        assert!(status.found);
    }

    #[test]
    fn stderr_tail_scrubs_paths_and_trims() {
        let tail = stderr_tail(b"warming up\n\nError: cannot read /tmp/job/in.png now\n");
        assert_eq!(tail, "Error: cannot read <path> now");
        assert_eq!(stderr_tail(b""), "");
    }
}
