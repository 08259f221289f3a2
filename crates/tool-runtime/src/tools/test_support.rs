//! Shell-script stand-ins for external tools.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::tool::ToolContext;

/// Write an executable `/bin/sh` script named `name` into `dir` and return its path.
pub fn stub(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// A context whose output and temp dirs live under `dir`.
pub fn context(dir: &Path, deadline_secs: u64) -> ToolContext {
    let output = dir.join("out");
    let temp = dir.join("tmp");
    std::fs::create_dir_all(&output).unwrap();
    std::fs::create_dir_all(&temp).unwrap();
    ToolContext::new(
        Uuid::new_v4(),
        output,
        temp,
        Duration::from_secs(deadline_secs),
        10 * 1024 * 1024,
        CancellationToken::new(),
    )
}
