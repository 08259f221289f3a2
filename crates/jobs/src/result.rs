//! Uniform `{ success, error, data }` response envelope.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use convertd_core::JobError;
use convertd_tool_runtime::OutputFile;

use crate::executor::JobOutcome;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub success: bool,
    pub error: Option<String>,
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            error: None,
            data,
        }
    }

    pub fn failure(error: &JobError) -> Self {
        Self {
            success: false,
            error: Some(error.message.clone()),
            data: json!({ "error_kind": error.kind }),
        }
    }
}

/// A retained output file and where to download it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileLink {
    pub name: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub url: String,
}

/// Turns a [`JobOutcome`] into an HTTP status and envelope.
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    download_prefix: String,
}

impl ResultBuilder {
    /// `download_prefix` is the route retained files are served under, e.g. `/files`.
    pub fn new(download_prefix: impl Into<String>) -> Self {
        Self {
            download_prefix: download_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn link(&self, job_id: impl std::fmt::Display, file: &OutputFile) -> FileLink {
        FileLink {
            name: file.name.clone(),
            size_bytes: file.size_bytes,
            content_type: file.content_type.clone(),
            url: format!("{}/{}/{}", self.download_prefix, job_id, file.name),
        }
    }

    pub fn build(&self, outcome: &JobOutcome) -> (u16, ResponseEnvelope) {
        let job = json!({
            "id": outcome.record.id,
            "kind": outcome.record.kind,
            "state": outcome.record.state,
            "elapsed_ms": outcome.record.elapsed_ms,
            "deadline_secs": outcome.record.deadline_secs,
        });

        match &outcome.result {
            Ok(output) => {
                let mut data = match &output.data {
                    Value::Object(map) => map.clone(),
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("result".to_string(), other.clone());
                        map
                    }
                };
                if outcome.retained {
                    let links: Vec<FileLink> = output
                        .files
                        .iter()
                        .map(|f| self.link(outcome.record.id, f))
                        .collect();
                    data.insert("files".to_string(), json!(links));
                }
                data.insert("job".to_string(), job);
                (200, ResponseEnvelope::ok(Value::Object(data)))
            }
            Err(e) => {
                let mut envelope = ResponseEnvelope::failure(e);
                if let Value::Object(map) = &mut envelope.data {
                    map.insert("job".to_string(), job);
                }
                (e.http_status(), envelope)
            }
        }
    }
}

impl Default for ResultBuilder {
    fn default() -> Self {
        Self::new("/files")
    }
}
