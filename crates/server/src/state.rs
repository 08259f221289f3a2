use std::sync::{Arc, RwLock};
use std::time::Instant;

use convertd_core::Config;
use convertd_jobs::{JobExecutor, ResultBuilder};
use convertd_tool_runtime::ToolStatus;

/// Shared handler state. Built once in `startup` and cloned behind an `Arc`.
pub struct AppState {
    pub config: Config,
    pub executor: Arc<JobExecutor>,
    pub results: ResultBuilder,
    /// Tool statuses from the startup preflight, shown on `/info`.
    pub tools: RwLock<Vec<ToolStatus>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn tool_statuses(&self) -> Vec<ToolStatus> {
        self.tools.read().map(|t| t.clone()).unwrap_or_default()
    }
}
