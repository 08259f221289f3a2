//! Job-scoped working areas under the storage root.
//!
//! Layout:
//!
//! ```text
//! <root>/uploads/<job_id>/   staged inputs
//! <root>/outputs/<job_id>/   deliverables (may outlive the job for download)
//! <root>/temp/<job_id>/      scratch
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use convertd_core::JobId;

use crate::error::StorageError;

/// Top-level storage categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Upload,
    Output,
    Temp,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Upload, Category::Output, Category::Temp];

    pub fn dir_name(self) -> &'static str {
        match self {
            Category::Upload => "uploads",
            Category::Output => "outputs",
            Category::Temp => "temp",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

type ActiveSet = Arc<Mutex<HashSet<JobId>>>;

/// Owns the storage root and the set of jobs whose areas are live.
#[derive(Clone)]
pub struct StorageManager {
    root: PathBuf,
    active: ActiveSet,
}

impl StorageManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.dir_name())
    }

    /// Create the three category directories and prove the root is writable.
    pub async fn ensure_layout(&self) -> Result<(), StorageError> {
        for category in Category::ALL {
            tokio::fs::create_dir_all(self.category_dir(category)).await?;
        }
        let probe = self
            .category_dir(Category::Temp)
            .join(format!(".write-probe-{}", Uuid::new_v4()));
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }

    /// Create the job's directories in every category and mark it active.
    ///
    /// Directories are created with `create_dir`, so an id that is already
    /// on disk fails instead of sharing another job's files.
    pub async fn allocate(&self, job_id: JobId) -> Result<WorkingArea, StorageError> {
        let dirs = Category::ALL.map(|c| self.category_dir(c).join(job_id.to_string()));
        for (i, dir) in dirs.iter().enumerate() {
            if let Err(e) = tokio::fs::create_dir(dir).await {
                for created in &dirs[..i] {
                    let _ = tokio::fs::remove_dir_all(created).await;
                }
                return Err(e.into());
            }
        }
        self.lock_active().insert(job_id);
        let [upload_dir, output_dir, temp_dir] = dirs;
        debug!(job_id = %job_id, "working area allocated");
        Ok(WorkingArea {
            job_id,
            upload_dir,
            output_dir,
            temp_dir,
            uploads: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.lock_active().contains(job_id)
    }

    pub fn active_jobs(&self) -> HashSet<JobId> {
        self.lock_active().clone()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        // The set holds plain ids; a poisoned lock still has a consistent set.
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stream an upload into the area's upload directory.
    ///
    /// `declared` (e.g. a multipart part's length) is checked before any byte is
    /// written; the running total is checked on every chunk so an undeclared
    /// oversized body is cut off as soon as it crosses `limit`.
    pub async fn write_upload<S, E>(
        &self,
        area: &WorkingArea,
        filename: &str,
        stream: S,
        declared: Option<u64>,
        limit: u64,
    ) -> Result<PathBuf, StorageError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        if declared.is_some_and(|d| d > limit) {
            return Err(StorageError::Oversized { limit });
        }
        if area.is_released() {
            return Err(StorageError::NotFound("working area".to_string()));
        }
        let index = area.uploads.fetch_add(1, Ordering::SeqCst);
        let path = area
            .upload_dir
            .join(format!("{index:02}-{}", sanitize_filename(filename)));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        futures::pin_mut!(stream);
        let mut written: u64 = 0;
        let result: Result<(), StorageError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| StorageError::Stream(e.to_string()))?;
                written += chunk.len() as u64;
                if written > limit {
                    return Err(StorageError::Oversized { limit });
                }
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            debug!(job_id = %area.job_id, written, error = %e, "upload aborted");
            return Err(e);
        }
        debug!(job_id = %area.job_id, bytes = written, "upload stored");
        Ok(path)
    }

    /// Tear down the area. Idempotent: only the first call removes anything.
    ///
    /// With `retain_output` the output directory is left for a later download
    /// unless it is empty.
    pub async fn release(&self, area: &WorkingArea, retain_output: bool) {
        if area.released.swap(true, Ordering::SeqCst) {
            return;
        }
        remove_dir(&area.upload_dir).await;
        remove_dir(&area.temp_dir).await;
        if !retain_output || dir_is_empty(&area.output_dir).await {
            remove_dir(&area.output_dir).await;
        }
        self.lock_active().remove(&area.job_id);
        debug!(job_id = %area.job_id, retain_output, "working area released");
    }

    /// Locate a retained output for download.
    pub async fn output_file(&self, job_id: JobId, name: &str) -> Result<(PathBuf, u64), StorageError> {
        if name.is_empty() || sanitize_filename(name) != name {
            return Err(StorageError::InvalidName("file name is not valid".to_string()));
        }
        let path = self
            .category_dir(Category::Output)
            .join(job_id.to_string())
            .join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok((path, meta.len())),
            Ok(_) => Err(StorageError::NotFound("file".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound("file".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a job's retained outputs. Returns `false` if there was nothing to delete.
    pub async fn consume_output(&self, job_id: JobId) -> Result<bool, StorageError> {
        if self.is_active(&job_id) {
            return Err(StorageError::InvalidName("job is still running".to_string()));
        }
        let dir = self.category_dir(Category::Output).join(job_id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// One job's exclusive slice of the storage tree.
///
/// Dropping an area that was never released removes everything it owns, so
/// a panic inside the executor cannot leak files or leave the job marked active.
pub struct WorkingArea {
    job_id: JobId,
    upload_dir: PathBuf,
    output_dir: PathBuf,
    temp_dir: PathBuf,
    uploads: AtomicUsize,
    released: AtomicBool,
    active: ActiveSet,
}

impl WorkingArea {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WorkingArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingArea")
            .field("job_id", &self.job_id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for WorkingArea {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(job_id = %self.job_id, "working area dropped without release; removing");
        for dir in [&self.upload_dir, &self.output_dir, &self.temp_dir] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %self.job_id, error = %e, "failed to remove working dir");
                }
            }
        }
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.job_id);
    }
}

/// Best-effort recursive delete; a missing directory is not an error.
async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, "failed to remove working dir");
        }
    }
}

async fn dir_is_empty(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => true,
    }
}

/// Reduce a client-supplied file name to a safe basename, keeping its extension.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    // keep the tail so the extension survives truncation
    let skip = cleaned.chars().count().saturating_sub(100);
    let mut out: String = cleaned.chars().skip(skip).collect();
    if out.is_empty() {
        out = "upload".to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, Infallible>> {
        let owned: Vec<Result<Bytes, Infallible>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        futures::stream::iter(owned)
    }

    async fn manager() -> (tempfile::TempDir, StorageManager) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path().join("storage"));
        storage.ensure_layout().await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn layout_has_three_categories() {
        let (_dir, storage) = manager().await;
        for c in Category::ALL {
            assert!(storage.category_dir(c).is_dir());
        }
    }

    #[tokio::test]
    async fn allocate_creates_scoped_dirs_and_tracks_active() {
        let (_dir, storage) = manager().await;
        let id = Uuid::new_v4();
        let area = storage.allocate(id).await.unwrap();
        assert!(area.upload_dir().ends_with(format!("uploads/{id}")));
        assert!(area.output_dir().is_dir());
        assert!(storage.is_active(&id));

        // the same id cannot be allocated twice
        assert!(storage.allocate(id).await.is_err());

        storage.release(&area, false).await;
        assert!(!storage.is_active(&id));
    }

    #[tokio::test]
    async fn release_removes_everything_and_is_idempotent() {
        let (_dir, storage) = manager().await;
        let area = storage.allocate(Uuid::new_v4()).await.unwrap();
        storage
            .write_upload(&area, "a.txt", chunks(&["hello"]), Some(5), 100)
            .await
            .unwrap();
        std::fs::write(area.output_dir().join("out.pdf"), b"pdf").unwrap();
        std::fs::write(area.temp_dir().join("scratch"), b"x").unwrap();

        storage.release(&area, false).await;
        assert!(!area.upload_dir().exists());
        assert!(!area.output_dir().exists());
        assert!(!area.temp_dir().exists());

        // second call is a no-op
        storage.release(&area, false).await;
        storage.release(&area, true).await;
    }

    #[tokio::test]
    async fn retained_output_survives_release() {
        let (_dir, storage) = manager().await;
        let id = Uuid::new_v4();
        let area = storage.allocate(id).await.unwrap();
        std::fs::write(area.output_dir().join("out.pdf"), b"pdf").unwrap();
        storage.release(&area, true).await;
        drop(area);

        assert!(!storage
            .category_dir(Category::Upload)
            .join(id.to_string())
            .exists());
        let (path, size) = storage.output_file(id, "out.pdf").await.unwrap();
        assert_eq!(size, 3);
        assert!(path.is_file());

        assert!(storage.consume_output(id).await.unwrap());
        assert!(!storage.consume_output(id).await.unwrap());
        assert!(matches!(
            storage.output_file(id, "out.pdf").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_output_is_not_retained() {
        let (_dir, storage) = manager().await;
        let area = storage.allocate(Uuid::new_v4()).await.unwrap();
        storage.release(&area, true).await;
        assert!(!area.output_dir().exists());
    }

    #[tokio::test]
    async fn declared_oversize_rejected_before_writing() {
        let (_dir, storage) = manager().await;
        let area = storage.allocate(Uuid::new_v4()).await.unwrap();
        let mb = 1024 * 1024;
        let err = storage
            .write_upload(&area, "big.mp4", chunks(&["x"]), Some(150 * mb), 100 * mb)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Oversized { .. }));
        assert_eq!(std::fs::read_dir(area.upload_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn observed_oversize_aborts_and_removes_partial_file() {
        let (_dir, storage) = manager().await;
        let area = storage.allocate(Uuid::new_v4()).await.unwrap();
        let err = storage
            .write_upload(&area, "big.bin", chunks(&["0123456789"; 5]), None, 25)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Oversized { limit: 25 }));
        assert_eq!(std::fs::read_dir(area.upload_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn uploads_never_collide() {
        let (_dir, storage) = manager().await;
        let area = storage.allocate(Uuid::new_v4()).await.unwrap();
        let a = storage
            .write_upload(&area, "clip.mp4", chunks(&["a"]), None, 10)
            .await
            .unwrap();
        let b = storage
            .write_upload(&area, "clip.mp4", chunks(&["b"]), None, 10)
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(a.extension().unwrap(), "mp4");
    }

    #[tokio::test]
    async fn dropping_unreleased_area_cleans_up() {
        let (_dir, storage) = manager().await;
        let id = Uuid::new_v4();
        let area = storage.allocate(id).await.unwrap();
        let upload_dir = area.upload_dir().to_path_buf();
        drop(area);
        assert!(!upload_dir.exists());
        assert!(!storage.is_active(&id));
    }

    #[tokio::test]
    async fn download_names_are_checked() {
        let (_dir, storage) = manager().await;
        let id = Uuid::new_v4();
        assert!(matches!(
            storage.output_file(id, "../secret").await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn sanitize_keeps_basename_and_extension() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\my scan.PNG"), "my_scan.PNG");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "upload");
    }
}
