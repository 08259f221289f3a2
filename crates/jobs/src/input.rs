//! Staging seam between a request's raw input and the tool adapter.
//!
//! Inputs are staged only after the job has been admitted and its working
//! area allocated, so a rejected job never writes anything to disk.

use async_trait::async_trait;
use bytes::Bytes;

use convertd_core::{JobError, KindLimits};
use convertd_storage::{StorageManager, WorkingArea};
use convertd_tool_runtime::ToolRequest;

/// What a [`JobInput`] may use while staging.
pub struct StagingContext<'a> {
    pub storage: &'a StorageManager,
    pub area: &'a WorkingArea,
    pub limits: &'a KindLimits,
}

impl StagingContext<'_> {
    /// Write one in-memory file into the area's uploads, honoring the input limit.
    pub async fn write_bytes(&self, filename: &str, data: Bytes) -> Result<std::path::PathBuf, JobError> {
        let len = data.len() as u64;
        let stream = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(data) });
        self.storage
            .write_upload(self.area, filename, stream, Some(len), self.limits.max_input_bytes)
            .await
            .map_err(|e| e.into_job_error())
    }
}

/// Turns a caller's input into a [`ToolRequest`] whose files live in the job's area.
#[async_trait]
pub trait JobInput: Send {
    async fn stage(self: Box<Self>, ctx: StagingContext<'_>) -> Result<ToolRequest, JobError>;
}

/// A request that carries no files (page fetches, text rendering).
#[async_trait]
impl JobInput for ToolRequest {
    async fn stage(self: Box<Self>, _ctx: StagingContext<'_>) -> Result<ToolRequest, JobError> {
        Ok(*self)
    }
}

/// A request plus files already held in memory.
pub struct MemoryInput {
    request: ToolRequest,
    files: Vec<(String, Bytes)>,
}

impl MemoryInput {
    pub fn new(request: ToolRequest) -> Self {
        Self {
            request,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.push((name.into(), data.into()));
        self
    }
}

#[async_trait]
impl JobInput for MemoryInput {
    async fn stage(self: Box<Self>, ctx: StagingContext<'_>) -> Result<ToolRequest, JobError> {
        let MemoryInput { mut request, files } = *self;
        for (name, data) in files {
            let path = ctx.write_bytes(&name, data).await?;
            request.inputs.push(path);
        }
        Ok(request)
    }
}
