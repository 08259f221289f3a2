//! Per-kind execution limits and deadline formulas.
//!
//! Each job kind carries an input ceiling, an output ceiling, and a
//! [`DeadlinePolicy`]. The policy is resolved into a concrete timeout once the
//! job's inputs are staged and the tool adapter has reported what it knows
//! about them (page count, media duration).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::JobKind;

const MB: u64 = 1024 * 1024;

/// How a kind's deadline is derived from its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Same deadline for every job of the kind.
    Fixed { timeout_secs: u64 },
    /// `base + per_page * pages`, capped at `ceiling`. Unknown page count gets the ceiling.
    PerPage {
        base_secs: u64,
        per_page_secs: u64,
        ceiling_secs: u64,
        max_pages: u32,
    },
    /// `base + factor * media_secs`, capped at `ceiling`. Unknown duration gets the ceiling.
    MediaDuration {
        base_secs: u64,
        factor: f64,
        ceiling_secs: u64,
        max_media_secs: u64,
    },
}

/// Facts about a job's inputs that make its deadline input-sensitive.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeadlineHints {
    pub pages: Option<u32>,
    pub media_secs: Option<f64>,
}

impl DeadlineHints {
    pub fn pages(pages: u32) -> Self {
        Self {
            pages: Some(pages),
            media_secs: None,
        }
    }

    pub fn media(secs: f64) -> Self {
        Self {
            pages: None,
            media_secs: Some(secs),
        }
    }
}

impl DeadlinePolicy {
    /// Resolve the deadline for a job with the given hints.
    ///
    /// Inputs above the page or duration ceiling are refused as oversized
    /// rather than given a truncated deadline.
    pub fn resolve(&self, hints: &DeadlineHints) -> Result<Duration, JobError> {
        let secs = match *self {
            DeadlinePolicy::Fixed { timeout_secs } => timeout_secs,
            DeadlinePolicy::PerPage {
                base_secs,
                per_page_secs,
                ceiling_secs,
                max_pages,
            } => match hints.pages {
                Some(pages) if pages > max_pages => {
                    return Err(JobError::oversized(format!(
                        "Document has {pages} pages; the limit is {max_pages}"
                    )));
                }
                Some(pages) => base_secs
                    .saturating_add(per_page_secs.saturating_mul(u64::from(pages)))
                    .min(ceiling_secs),
                None => ceiling_secs,
            },
            DeadlinePolicy::MediaDuration {
                base_secs,
                factor,
                ceiling_secs,
                max_media_secs,
            } => match hints.media_secs.filter(|d| d.is_finite() && *d >= 0.0) {
                Some(duration) if duration > max_media_secs as f64 => {
                    return Err(JobError::oversized(format!(
                        "Media is {:.0}s long; the limit is {max_media_secs}s",
                        duration
                    )));
                }
                Some(duration) => {
                    let scaled = (factor * duration).ceil() as u64;
                    base_secs.saturating_add(scaled).min(ceiling_secs)
                }
                None => ceiling_secs,
            },
        };
        Ok(Duration::from_secs(secs.max(1)))
    }

    /// Longest deadline this policy can ever produce.
    pub fn ceiling(&self) -> Duration {
        let secs = match *self {
            DeadlinePolicy::Fixed { timeout_secs } => timeout_secs,
            DeadlinePolicy::PerPage { ceiling_secs, .. } => ceiling_secs,
            DeadlinePolicy::MediaDuration { ceiling_secs, .. } => ceiling_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Immutable limits for one kind, copied into each job at admission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KindLimits {
    pub max_input_bytes: u64,
    pub max_output_bytes: u64,
    pub deadline: DeadlinePolicy,
}

/// Live limits for every kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsTable {
    pub ocr: KindLimits,
    pub render: KindLimits,
    pub transcode: KindLimits,
    pub fetch: KindLimits,
}

impl LimitsTable {
    pub fn get(&self, kind: JobKind) -> KindLimits {
        match kind {
            JobKind::Ocr => self.ocr,
            JobKind::Render => self.render,
            JobKind::Transcode => self.transcode,
            JobKind::Fetch => self.fetch,
        }
    }

    pub fn set(&mut self, kind: JobKind, limits: KindLimits) {
        match kind {
            JobKind::Ocr => self.ocr = limits,
            JobKind::Render => self.render = limits,
            JobKind::Transcode => self.transcode = limits,
            JobKind::Fetch => self.fetch = limits,
        }
    }
}

impl Default for LimitsTable {
    fn default() -> Self {
        Self {
            ocr: KindLimits {
                max_input_bytes: 100 * MB,
                max_output_bytes: 50 * MB,
                deadline: DeadlinePolicy::PerPage {
                    base_secs: 15,
                    per_page_secs: 5,
                    ceiling_secs: 1800,
                    max_pages: 500,
                },
            },
            render: KindLimits {
                max_input_bytes: 100 * MB,
                max_output_bytes: 100 * MB,
                deadline: DeadlinePolicy::Fixed { timeout_secs: 120 },
            },
            transcode: KindLimits {
                max_input_bytes: 100 * MB,
                max_output_bytes: 500 * MB,
                deadline: DeadlinePolicy::MediaDuration {
                    base_secs: 30,
                    factor: 2.0,
                    ceiling_secs: 900,
                    max_media_secs: 600,
                },
            },
            fetch: KindLimits {
                max_input_bytes: 100 * MB,
                max_output_bytes: 10 * MB,
                deadline: DeadlinePolicy::Fixed { timeout_secs: 60 },
            },
        }
    }
}
