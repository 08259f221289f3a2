//! Drives one job from admission to exactly one terminal state.
//!
//! ```text
//! acquire ticket ─▶ claim worker ─▶ allocate area ─▶ stage input ─▶ probe
//!   ─▶ resolve deadline ─▶ invoke adapter ─▶ check output size ─▶ release
//! ```
//!
//! Every exit path, including a panic inside an adapter, releases the area
//! (unless retained), the worker slot, and the ticket, and records the job.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convertd_core::{
    Config, ErrorKind, Job, JobError, JobId, JobKind, JobRecord, JobState, KindLimits, LimitsTable,
};
use convertd_storage::{StorageManager, WorkingArea};
use convertd_tool_runtime::{ToolContext, ToolError, ToolOutput, ToolRegistry};

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::history::{JobHistory, JobTotals};
use crate::input::{JobInput, StagingContext};
use crate::pool::{WorkerPool, WorkerUsage};

/// Extra time an adapter gets past its deadline before the executor drops it.
const DEADLINE_BACKSTOP: Duration = Duration::from_secs(5);

/// How a job ended, with its tool output on success.
#[derive(Debug)]
pub struct JobOutcome {
    pub record: JobRecord,
    pub result: Result<ToolOutput, JobError>,
    /// Output files were kept for download.
    pub retained: bool,
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        self.record.id
    }

    pub fn state(&self) -> JobState {
        self.record.state
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn http_status(&self) -> u16 {
        match &self.result {
            Ok(_) => 200,
            Err(e) => e.http_status(),
        }
    }
}

/// Live counters for the info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub admission: AdmissionSnapshot,
    pub workers: WorkerUsage,
    pub active_jobs: usize,
    pub totals: JobTotals,
    pub shutting_down: bool,
}

pub struct JobExecutor {
    admission: AdmissionController,
    pool: WorkerPool,
    storage: StorageManager,
    registry: ToolRegistry,
    limits: RwLock<LimitsTable>,
    history: JobHistory,
    shutdown: CancellationToken,
}

impl JobExecutor {
    pub fn new(
        admission: AdmissionController,
        pool: WorkerPool,
        storage: StorageManager,
        registry: ToolRegistry,
        limits: LimitsTable,
    ) -> Self {
        Self {
            admission,
            pool,
            storage,
            registry,
            limits: RwLock::new(limits),
            history: JobHistory::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config, storage: StorageManager, registry: ToolRegistry) -> Self {
        Self::new(
            AdmissionController::new(&config.admission),
            WorkerPool::new(config.server.workers),
            storage,
            registry,
            config.limits.clone(),
        )
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Limits a job of `kind` admitted now would receive.
    pub fn limits_for(&self, kind: JobKind) -> KindLimits {
        self.limits
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(kind)
    }

    pub fn limits(&self) -> LimitsTable {
        self.limits.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace the live limits. Jobs already admitted keep their snapshot.
    pub fn update_limits(&self, limits: LimitsTable) {
        *self.limits.write().unwrap_or_else(|p| p.into_inner()) = limits;
        info!("job limits updated");
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            admission: self.admission.snapshot(),
            workers: self.pool.usage(),
            active_jobs: self.storage.active_jobs().len(),
            totals: self.history.totals(),
            shutting_down: self.is_shutting_down(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.pool.is_closed() || self.shutdown.is_cancelled()
    }

    /// Run one job to completion. Never panics and never returns without a terminal state.
    pub async fn run(&self, kind: JobKind, input: Box<dyn JobInput>, retain_output: bool) -> JobOutcome {
        let mut job = Job::new(kind, self.limits_for(kind));

        let mut ticket = match self.admission.acquire(kind) {
            Ok(ticket) => ticket,
            Err(e) => return self.finish(job, Err(e), false),
        };
        let Some(worker) = self.pool.try_claim() else {
            let reason = if self.is_shutting_down() {
                "Server is shutting down"
            } else {
                "No worker is free; retry later"
            };
            return self.finish(job, Err(JobError::rejected(reason)), false);
        };
        info!(job_id = %job.id(), kind = %kind, "job admitted");

        let area = match self.storage.allocate(job.id()).await {
            Ok(area) => area,
            Err(e) => {
                error!(job_id = %job.id(), kind = %kind, error = %e, "working area allocation failed");
                drop(worker);
                ticket.release();
                return self.finish(
                    job,
                    Err(JobError::storage("working storage is unavailable")),
                    false,
                );
            }
        };

        let result = match job.transition(JobState::Running) {
            Ok(()) => {
                debug!(job_id = %job.id(), kind = %kind, state = %job.state(), "job started");
                AssertUnwindSafe(self.execute(&mut job, input, &area))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(job_id = %job.id(), kind = %kind, "job panicked");
                        Err(JobError::crashed(format!("{kind} job failed unexpectedly")))
                    })
            }
            Err(e) => Err(e),
        };

        let retained = retain_output && result.as_ref().is_ok_and(|o| !o.files.is_empty());
        self.storage.release(&area, retained).await;
        drop(worker);
        ticket.release();

        self.finish(job, result, retained)
    }

    /// Run a job on its own task.
    ///
    /// The job reaches a terminal state, releases its resources, and is
    /// recorded even when the caller stops waiting (a client disconnect
    /// drops the request future).
    pub async fn run_detached(
        self: Arc<Self>,
        kind: JobKind,
        input: Box<dyn JobInput>,
        retain_output: bool,
    ) -> JobOutcome {
        let limits = self.limits_for(kind);
        let executor = Arc::clone(&self);
        match tokio::spawn(async move { executor.run(kind, input, retain_output).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(kind = %kind, error = %e, "job task ended abnormally");
                self.finish(
                    Job::new(kind, limits),
                    Err(JobError::crashed(format!("{kind} job failed unexpectedly"))),
                    false,
                )
            }
        }
    }

    async fn execute(
        &self,
        job: &mut Job,
        input: Box<dyn JobInput>,
        area: &WorkingArea,
    ) -> Result<ToolOutput, JobError> {
        let kind = job.kind();
        let limits = *job.limits();
        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| JobError::unsupported(format!("{kind} jobs are not available")))?;

        let request = input
            .stage(StagingContext {
                storage: &self.storage,
                area,
                limits: &limits,
            })
            .await?;
        if !adapter.operations().contains(&request.operation.as_str()) {
            return Err(JobError::unsupported(format!(
                "unknown {kind} operation '{}'",
                request.operation
            )));
        }

        let mut ctx = ToolContext::new(
            job.id(),
            area.output_dir().to_path_buf(),
            area.temp_dir().to_path_buf(),
            limits.deadline.ceiling(),
            limits.max_output_bytes,
            self.shutdown.child_token(),
        );
        let hints = adapter
            .probe(&request, &ctx)
            .await
            .map_err(|e| e.into_job_error(kind))?;
        let deadline = limits.deadline.resolve(&hints)?;
        job.set_deadline_secs(deadline.as_secs());
        ctx.start_clock(deadline);
        debug!(
            job_id = %job.id(),
            kind = %kind,
            operation = %request.operation,
            deadline_secs = deadline.as_secs(),
            "invoking tool"
        );

        let output = match tokio::time::timeout(deadline + DEADLINE_BACKSTOP, adapter.invoke(&request, &ctx)).await {
            Ok(result) => result.map_err(|e| e.into_job_error(kind))?,
            Err(_) => {
                warn!(job_id = %job.id(), kind = %kind, "adapter overran its deadline; dropped");
                return Err(ToolError::Timeout(deadline).into_job_error(kind));
            }
        };

        let total = output.total_bytes();
        if total > limits.max_output_bytes {
            return Err(JobError::output_too_large(format!(
                "{kind} output is {} bytes; the limit is {} bytes",
                total, limits.max_output_bytes
            )));
        }
        Ok(output)
    }

    /// Enter the terminal state, log it once, and record it.
    fn finish(&self, mut job: Job, result: Result<ToolOutput, JobError>, retained: bool) -> JobOutcome {
        let transition = match &result {
            Ok(_) => job.transition(JobState::Succeeded),
            Err(e) => job.fail(e.clone()),
        };
        if let Err(e) = transition {
            error!(job_id = %job.id(), state = %job.state(), error = %e, "job state transition refused");
        }

        let record = job.record();
        let elapsed_ms = record.elapsed_ms.unwrap_or(0);
        match &result {
            Ok(_) => info!(
                job_id = %record.id,
                kind = %record.kind,
                state = %record.state,
                elapsed_ms,
                retained,
                "job finished"
            ),
            Err(e) if e.kind == ErrorKind::RejectedAtCapacity => info!(
                job_id = %record.id,
                kind = %record.kind,
                state = %record.state,
                reason = %e,
                "job rejected"
            ),
            Err(e) => warn!(
                job_id = %record.id,
                kind = %record.kind,
                state = %record.state,
                elapsed_ms,
                error_kind = %e.kind,
                error = %e,
                "job failed"
            ),
        }

        self.history.push(record.clone());
        JobOutcome {
            record,
            result,
            retained,
        }
    }

    /// Stop admitting, give running jobs `grace` to finish, then kill what is left.
    ///
    /// Returns `true` when every job finished inside the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!(grace_secs = grace.as_secs(), "draining running jobs");
        self.pool.close();
        let drained = self.pool.wait_idle(grace).await;
        if !drained {
            let busy = self.pool.usage().busy;
            warn!(busy, "grace period elapsed; terminating running tools");
            self.shutdown.cancel();
            // Killed tools are reaped before their jobs return.
            while self.pool.usage().busy > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        self.shutdown.cancel();
        info!(drained, "executor stopped");
        drained
    }
}
