use std::collections::BTreeMap;
use std::sync::Arc;

use convertd_core::{Config, JobKind};

use crate::tool::{ToolAdapter, ToolError, ToolStatus};
use crate::tools::{FetchAdapter, OcrAdapter, RenderAdapter, TranscodeAdapter};

/// Maps each job kind to the adapter that executes it.
/// Thread-safe via Arc wrapping of individual adapters.
#[derive(Clone)]
pub struct ToolRegistry {
    adapters: BTreeMap<JobKind, Arc<dyn ToolAdapter>>,
    ocr: Option<Arc<OcrAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
            ocr: None,
        }
    }

    /// Registry with the four built-in adapters wired from config.
    pub fn from_config(config: &Config) -> Result<Self, ToolError> {
        let mut registry = Self::new();
        let ocr = Arc::new(OcrAdapter::new(&config.tools, &config.ocr));
        registry.ocr = Some(ocr.clone());
        registry.insert(ocr)?;
        registry.register(RenderAdapter::new(&config.tools))?;
        registry.register(TranscodeAdapter::new(&config.tools, &config.transcode))?;
        registry.register(FetchAdapter::new(&config.fetch)?)?;
        Ok(registry)
    }

    /// Register an adapter. Returns error if its kind is already covered.
    pub fn register(&mut self, adapter: impl ToolAdapter + 'static) -> Result<(), ToolError> {
        self.insert(Arc::new(adapter))
    }

    fn insert(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<(), ToolError> {
        let kind = adapter.kind();
        if self.adapters.contains_key(&kind) {
            return Err(ToolError::Other(anyhow::anyhow!(
                "an adapter for {kind} is already registered"
            )));
        }
        self.adapters.insert(kind, adapter);
        Ok(())
    }

    /// Look up the adapter for a kind.
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Installed OCR languages, as captured by the last preflight.
    pub fn ocr_languages(&self) -> Vec<String> {
        self.ocr.as_ref().map(|o| o.languages()).unwrap_or_default()
    }

    /// Run every adapter's preflight check.
    pub async fn check_all(&self) -> Vec<ToolStatus> {
        let checks = self.adapters.values().map(|a| a.check());
        futures::future::join_all(checks).await
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.adapters.keys().copied().collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
