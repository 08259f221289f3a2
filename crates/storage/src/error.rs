use thiserror::Error;

use convertd_core::JobError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("input exceeds the {limit} byte limit")]
    Oversized { limit: u64 },

    #[error("upload stream failed: {0}")]
    Stream(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Collapse into the shared taxonomy without leaking paths.
    pub fn into_job_error(self) -> JobError {
        match self {
            StorageError::Oversized { limit } => JobError::oversized(format!(
                "Upload exceeds the {} MB limit",
                (limit / (1024 * 1024)).max(1)
            )),
            StorageError::Stream(_) => JobError::invalid("upload could not be read"),
            StorageError::InvalidName(m) => JobError::invalid(m),
            StorageError::NotFound(m) => JobError::invalid(format!("{m} not found")),
            StorageError::Io(_) => JobError::storage("working storage is unavailable"),
        }
    }
}
