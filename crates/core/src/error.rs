use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories every job outcome is normalized into.
///
/// Tool adapters, storage, and the executor each have their own error types;
/// all of them collapse into one of these kinds at the executor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RejectedAtCapacity,
    OversizedInput,
    UnsupportedFormat,
    InvalidParameters,
    ToolTimeout,
    ToolCrashed,
    OutputTooLarge,
    StorageUnavailable,
}

impl ErrorKind {
    /// HTTP status code reported alongside the response envelope.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::RejectedAtCapacity => 503,
            ErrorKind::OversizedInput => 413,
            ErrorKind::UnsupportedFormat | ErrorKind::InvalidParameters => 400,
            ErrorKind::ToolTimeout => 504,
            ErrorKind::ToolCrashed | ErrorKind::OutputTooLarge | ErrorKind::StorageUnavailable => {
                500
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RejectedAtCapacity => "rejected_at_capacity",
            ErrorKind::OversizedInput => "oversized_input",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolCrashed => "tool_crashed",
            ErrorKind::OutputTooLarge => "output_too_large",
            ErrorKind::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, user-presentable job failure.
///
/// `message` is shown to callers verbatim, so it must never carry
/// filesystem paths or raw tool output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RejectedAtCapacity, message)
    }

    pub fn oversized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OversizedInput, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFormat, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameters, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolTimeout, message)
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolCrashed, message)
    }

    pub fn output_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutputTooLarge, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageUnavailable, message)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}
