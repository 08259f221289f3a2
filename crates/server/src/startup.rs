//! Server startup: storage root, tool preflight, and shared state.
//!
//! Faults here are process-level: an unwritable storage root or a missing
//! required binary aborts startup with a diagnostic.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::Context;
use tracing::{info, warn};

use convertd_core::Config;
use convertd_jobs::{JobExecutor, ResultBuilder};
use convertd_storage::StorageManager;
use convertd_tool_runtime::{ToolRegistry, ToolStatus};

use crate::state::AppState;

/// Route prefix retained outputs are downloaded from.
pub const DOWNLOAD_PREFIX: &str = "/files";

/// Create the storage layout and prove it is writable.
pub async fn prepare_storage(config: &Config) -> anyhow::Result<StorageManager> {
    let storage = StorageManager::new(&config.storage.storage_dir);
    storage.ensure_layout().await.with_context(|| {
        format!(
            "storage root {} is not usable",
            config.storage.storage_dir.display()
        )
    })?;
    info!("Storage ready at {}", config.storage.storage_dir.display());
    Ok(storage)
}

/// Check every adapter's binaries.
///
/// With `require` set, any missing binary is an error; otherwise it is logged
/// and the affected kind will fail per job.
pub async fn preflight(registry: &ToolRegistry, require: bool) -> anyhow::Result<Vec<ToolStatus>> {
    let statuses = registry.check_all().await;
    let mut missing = Vec::new();
    for status in &statuses {
        for binary in &status.binaries {
            match (&binary.found, &binary.version) {
                (true, Some(version)) => info!("  {:<10} {:<12} {}", status.kind.as_str(), binary.name, version),
                (true, None) => info!("  {:<10} {:<12} found", status.kind.as_str(), binary.name),
                (false, _) => {
                    warn!("  {:<10} {:<12} MISSING", status.kind.as_str(), binary.name);
                    missing.push(format!("{} ({})", binary.name, status.kind));
                }
            }
        }
    }
    if !missing.is_empty() {
        if require {
            anyhow::bail!(
                "required tools are missing: {}. Install them or set REQUIRE_TOOLS=false",
                missing.join(", ")
            );
        }
        warn!("Continuing without: {}", missing.join(", "));
    }
    Ok(statuses)
}

/// Build `AppState` from config: storage, registry, preflight, executor.
pub async fn build_app_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let storage = prepare_storage(config).await?;
    let registry = ToolRegistry::from_config(config).context("failed to build tool registry")?;
    info!("Tool preflight:");
    let tools = preflight(&registry, config.tools.require).await?;

    Ok(assemble(config.clone(), storage, registry, tools))
}

/// Wire already-prepared parts into `AppState`.
pub fn assemble(
    config: Config,
    storage: StorageManager,
    registry: ToolRegistry,
    tools: Vec<ToolStatus>,
) -> Arc<AppState> {
    let executor = Arc::new(JobExecutor::from_config(&config, storage, registry));
    Arc::new(AppState {
        config,
        executor,
        results: ResultBuilder::new(DOWNLOAD_PREFIX),
        tools: RwLock::new(tools),
        started_at: Instant::now(),
    })
}
