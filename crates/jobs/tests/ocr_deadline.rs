#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use convertd_core::config::{AdmissionConfig, OcrConfig, ToolsConfig};
use convertd_core::{DeadlinePolicy, ErrorKind, JobKind, JobState, KindLimits, LimitsTable};
use convertd_jobs::{AdmissionController, JobExecutor, MemoryInput, ResultBuilder, WorkerPool};
use convertd_storage::{Category, StorageManager};
use convertd_tool_runtime::{OcrAdapter, ToolRegistry, ToolRequest};

fn stub(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn executor(root: &Path, tesseract: String) -> JobExecutor {
    let storage = StorageManager::new(root.join("storage"));
    storage.ensure_layout().await.unwrap();

    let tools = ToolsConfig {
        tesseract,
        ..ToolsConfig::default()
    };
    let mut registry = ToolRegistry::new();
    registry
        .register(OcrAdapter::new(&tools, &OcrConfig::default()))
        .unwrap();

    let mut limits = LimitsTable::default();
    limits.ocr = KindLimits {
        max_input_bytes: 1024 * 1024,
        max_output_bytes: 1024 * 1024,
        deadline: DeadlinePolicy::PerPage {
            base_secs: 5,
            per_page_secs: 0,
            ceiling_secs: 5,
            max_pages: 500,
        },
    };

    JobExecutor::new(
        AdmissionController::new(&AdmissionConfig {
            global_max: 2,
            per_kind: Default::default(),
        }),
        WorkerPool::new(2),
        storage,
        registry,
        limits,
    )
}

fn scan() -> Box<MemoryInput> {
    Box::new(MemoryInput::new(ToolRequest::new("image")).with_file("scan.png", &b"\x89PNG"[..]))
}

#[tokio::test]
async fn slow_ocr_tool_is_killed_at_its_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("tesseract.pid");
    let tesseract = stub(
        dir.path(),
        "tesseract",
        &format!("echo $$ > {}\nexec sleep 10", pid_file.display()),
    );
    let executor = executor(dir.path(), tesseract).await;

    let started = Instant::now();
    let outcome = executor.run(JobKind::Ocr, scan(), true).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.state(), JobState::TimedOut);
    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ToolTimeout);
    assert_eq!(err.message, "ocr job exceeded its 5s deadline");
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(9));
    assert_eq!(outcome.record.deadline_secs, Some(5));

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    assert!(!alive(pid.trim()), "tool process outlived its job");

    assert!(!outcome.retained);
    for category in Category::ALL {
        let dir = executor.storage().category_dir(category);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0, "{category} not empty");
    }

    let (status, envelope) = ResultBuilder::default().build(&outcome);
    assert_eq!(status, 504);
    assert!(!envelope.success);
}

#[tokio::test]
async fn crashing_ocr_tool_reports_scrubbed_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let tesseract = stub(
        dir.path(),
        "tesseract",
        "echo 'Error: cannot read /srv/storage/uploads/x/00-scan.png' >&2\nexit 1",
    );
    let executor = executor(dir.path(), tesseract).await;

    let outcome = executor.run(JobKind::Ocr, scan(), false).await;

    assert_eq!(outcome.state(), JobState::Failed);
    let err = outcome.result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ToolCrashed);
    assert!(!err.message.contains("/srv/storage"), "{}", err.message);
    assert_eq!(executor.admission().running_total(), 0);
}

#[tokio::test]
async fn ocr_success_returns_text() {
    let dir = tempfile::tempdir().unwrap();
    let tesseract = stub(dir.path(), "tesseract", "echo 'Hello world'");
    let executor = executor(dir.path(), tesseract).await;

    let outcome = executor.run(JobKind::Ocr, scan(), false).await;

    assert_eq!(outcome.state(), JobState::Succeeded);
    let output = outcome.result.as_ref().unwrap();
    assert_eq!(output.data["text"], "Hello world");
    assert!(outcome.record.elapsed_ms.is_some());
}
