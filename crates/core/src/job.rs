use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, JobError};
use crate::limits::KindLimits;

/// Opaque job identifier, assigned at admission.
pub type JobId = Uuid;

/// Category of conversion a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Ocr,
    Render,
    Transcode,
    Fetch,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Ocr,
        JobKind::Render,
        JobKind::Transcode,
        JobKind::Fetch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Ocr => "ocr",
            JobKind::Render => "render",
            JobKind::Transcode => "transcode",
            JobKind::Fetch => "fetch",
        }
    }

    /// Upper-case suffix used for per-kind environment keys (`MAX_CONCURRENT_OCR`).
    pub fn env_suffix(self) -> &'static str {
        match self {
            JobKind::Ocr => "OCR",
            JobKind::Render => "RENDER",
            JobKind::Transcode => "TRANSCODE",
            JobKind::Fetch => "FETCH",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Rejected,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Rejected
        )
    }

    /// Queued → Running → {Succeeded, Failed, TimedOut}; Queued → {Rejected, Failed}.
    ///
    /// Queued → Failed covers jobs whose working area could not be allocated
    /// or whose inputs failed staging before the tool ever ran.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Rejected)
                | (Queued, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request's execution record.
///
/// `limits` is a copy taken at admission; replacing the live limits table
/// afterwards does not reach jobs that are already in flight.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    kind: JobKind,
    state: JobState,
    limits: KindLimits,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    deadline_secs: Option<u64>,
    error: Option<JobError>,
}

impl Job {
    pub fn new(kind: JobKind, limits: KindLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: JobState::Queued,
            limits,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deadline_secs: None,
            error: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn limits(&self) -> &KindLimits {
        &self.limits
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn set_deadline_secs(&mut self, secs: u64) {
        self.deadline_secs = Some(secs);
    }

    /// Move to `next`, stamping `started_at`/`completed_at` as they are reached.
    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::crashed(format!(
                "illegal job state transition {} -> {}",
                self.state, next
            )));
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Enter the terminal state that corresponds to `error`.
    pub fn fail(&mut self, error: JobError) -> Result<(), JobError> {
        let next = match error.kind {
            ErrorKind::RejectedAtCapacity => JobState::Rejected,
            ErrorKind::ToolTimeout => JobState::TimedOut,
            _ => JobState::Failed,
        };
        self.transition(next)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn record(&self) -> JobRecord {
        let elapsed_ms = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        };
        JobRecord {
            id: self.id,
            kind: self.kind,
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            elapsed_ms,
            deadline_secs: self.deadline_secs,
            limits: self.limits,
            error_kind: self.error.as_ref().map(|e| e.kind),
        }
    }
}

/// Serializable snapshot of a job, kept in the recent-jobs history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub deadline_secs: Option<u64>,
    pub limits: KindLimits,
    pub error_kind: Option<ErrorKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitsTable;

    fn job(kind: JobKind) -> Job {
        Job::new(kind, LimitsTable::default().get(kind))
    }

    #[test]
    fn happy_path_stamps_timestamps() {
        let mut j = job(JobKind::Fetch);
        assert!(j.started_at().is_none());
        j.transition(JobState::Running).unwrap();
        assert!(j.started_at().is_some());
        assert!(j.completed_at().is_none());
        j.transition(JobState::Succeeded).unwrap();
        assert!(j.completed_at().is_some());
        assert!(j.record().elapsed_ms.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut j = job(JobKind::Ocr);
        j.transition(JobState::Running).unwrap();
        j.transition(JobState::TimedOut).unwrap();
        assert!(j.transition(JobState::Succeeded).is_err());
        assert!(j.transition(JobState::Running).is_err());
        assert_eq!(j.state(), JobState::TimedOut);
    }

    #[test]
    fn no_state_is_revisited() {
        let mut j = job(JobKind::Render);
        j.transition(JobState::Running).unwrap();
        assert!(j.transition(JobState::Queued).is_err());
        assert!(j.transition(JobState::Running).is_err());
    }

    #[test]
    fn fail_maps_error_kind_to_state() {
        let mut rejected = job(JobKind::Fetch);
        rejected.fail(JobError::rejected("full")).unwrap();
        assert_eq!(rejected.state(), JobState::Rejected);
        assert!(rejected.started_at().is_none());

        let mut timed_out = job(JobKind::Ocr);
        timed_out.transition(JobState::Running).unwrap();
        timed_out.fail(JobError::timeout("slow")).unwrap();
        assert_eq!(timed_out.state(), JobState::TimedOut);

        let mut too_big = job(JobKind::Transcode);
        too_big.transition(JobState::Running).unwrap();
        too_big.fail(JobError::output_too_large("big")).unwrap();
        assert_eq!(too_big.state(), JobState::Failed);
        assert_eq!(too_big.record().error_kind, Some(ErrorKind::OutputTooLarge));
    }

    #[test]
    fn rejection_only_from_queued() {
        let mut j = job(JobKind::Fetch);
        j.transition(JobState::Running).unwrap();
        assert!(j.fail(JobError::rejected("late")).is_err());
    }
}
