//! Non-blocking admission: a ticket now, or a rejection now.
//!
//! Both the global counter and the per-kind counter live behind one mutex so
//! they always move together. There is no wait queue.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use convertd_core::config::AdmissionConfig;
use convertd_core::{JobError, JobKind};

#[derive(Debug, Default)]
struct Counters {
    global: usize,
    per_kind: BTreeMap<JobKind, usize>,
}

/// Running/allowed counts for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindUsage {
    pub running: usize,
    pub max: usize,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub running: usize,
    pub global_max: usize,
    pub per_kind: BTreeMap<JobKind, KindUsage>,
}

#[derive(Clone)]
pub struct AdmissionController {
    global_max: usize,
    per_kind_max: BTreeMap<JobKind, usize>,
    counters: Arc<Mutex<Counters>>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        let per_kind_max = JobKind::ALL
            .iter()
            .map(|k| (*k, config.max_for(*k).min(config.global_max)))
            .collect();
        Self {
            global_max: config.global_max,
            per_kind_max,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    pub fn max_for(&self, kind: JobKind) -> usize {
        self.per_kind_max.get(&kind).copied().unwrap_or(self.global_max)
    }

    /// Take a ticket for `kind`, or fail immediately with `ErrRejectedAtCapacity`.
    pub fn acquire(&self, kind: JobKind) -> Result<Ticket, JobError> {
        let mut counters = lock(&self.counters);
        let running_kind = counters.per_kind.get(&kind).copied().unwrap_or(0);

        if counters.global >= self.global_max {
            return Err(JobError::rejected(format!(
                "Server is at capacity ({} jobs running); retry later",
                counters.global
            )));
        }
        if running_kind >= self.max_for(kind) {
            return Err(JobError::rejected(format!(
                "Too many {kind} jobs running ({running_kind}); retry later"
            )));
        }

        counters.global += 1;
        *counters.per_kind.entry(kind).or_insert(0) += 1;
        debug!(kind = %kind, global = counters.global, "admission ticket issued");

        Ok(Ticket {
            kind,
            counters: Arc::clone(&self.counters),
            released: false,
        })
    }

    pub fn running(&self, kind: JobKind) -> usize {
        lock(&self.counters).per_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn running_total(&self) -> usize {
        lock(&self.counters).global
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let counters = lock(&self.counters);
        let per_kind = JobKind::ALL
            .iter()
            .map(|k| {
                (
                    *k,
                    KindUsage {
                        running: counters.per_kind.get(k).copied().unwrap_or(0),
                        max: self.max_for(*k),
                    },
                )
            })
            .collect();
        AdmissionSnapshot {
            running: counters.global,
            global_max: self.global_max,
            per_kind,
        }
    }
}

fn lock(counters: &Mutex<Counters>) -> MutexGuard<'_, Counters> {
    // Counter updates cannot panic halfway, so a poisoned guard is still consistent.
    counters.lock().unwrap_or_else(|p| p.into_inner())
}

/// One unit of admitted capacity. Released on drop if not released earlier.
#[derive(Debug)]
pub struct Ticket {
    kind: JobKind,
    counters: Arc<Mutex<Counters>>,
    released: bool,
}

impl Ticket {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Return the capacity. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut counters = lock(&self.counters);
        counters.global = counters.global.saturating_sub(1);
        if let Some(n) = counters.per_kind.get_mut(&self.kind) {
            *n = n.saturating_sub(1);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convertd_core::ErrorKind;

    fn controller(global: usize, per_kind: &[(JobKind, usize)]) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            global_max: global,
            per_kind: per_kind.iter().copied().collect(),
        })
    }

    #[test]
    fn third_fetch_is_rejected_at_global_cap() {
        let admission = controller(2, &[]);
        let _a = admission.acquire(JobKind::Fetch).unwrap();
        let _b = admission.acquire(JobKind::Fetch).unwrap();

        let err = admission.acquire(JobKind::Fetch).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RejectedAtCapacity);
        assert_eq!(err.http_status(), 503);
        assert_eq!(admission.running_total(), 2);
    }

    #[test]
    fn per_kind_cap_is_independent_of_other_kinds() {
        let admission = controller(3, &[(JobKind::Transcode, 1)]);
        let _t = admission.acquire(JobKind::Transcode).unwrap();
        assert!(admission.acquire(JobKind::Transcode).is_err());
        let _o = admission.acquire(JobKind::Ocr).unwrap();
        assert_eq!(admission.running(JobKind::Transcode), 1);
        assert_eq!(admission.running(JobKind::Ocr), 1);
    }

    #[test]
    fn per_kind_cap_never_exceeds_global() {
        let admission = controller(2, &[(JobKind::Ocr, 5)]);
        assert_eq!(admission.max_for(JobKind::Ocr), 2);
        assert_eq!(admission.max_for(JobKind::Render), 2);
    }

    #[test]
    fn release_is_idempotent_and_drop_does_not_double_count() {
        let admission = controller(2, &[]);
        let mut a = admission.acquire(JobKind::Render).unwrap();
        let _b = admission.acquire(JobKind::Render).unwrap();

        a.release();
        a.release();
        assert_eq!(admission.running_total(), 1);
        drop(a);
        assert_eq!(admission.running_total(), 1);
        assert_eq!(admission.running(JobKind::Render), 1);
    }

    #[test]
    fn dropped_ticket_frees_capacity() {
        let admission = controller(1, &[]);
        {
            let _t = admission.acquire(JobKind::Ocr).unwrap();
            assert!(admission.acquire(JobKind::Fetch).is_err());
        }
        assert!(admission.acquire(JobKind::Fetch).is_ok());
    }

    #[test]
    fn snapshot_lists_every_kind() {
        let admission = controller(2, &[(JobKind::Fetch, 1)]);
        let _t = admission.acquire(JobKind::Fetch).unwrap();
        let snap = admission.snapshot();
        assert_eq!(snap.running, 1);
        assert_eq!(snap.per_kind.len(), 4);
        assert_eq!(snap.per_kind[&JobKind::Fetch], KindUsage { running: 1, max: 1 });
        assert_eq!(snap.per_kind[&JobKind::Ocr], KindUsage { running: 0, max: 2 });
    }

    #[test]
    fn counters_hold_under_contention() {
        let admission = controller(4, &[(JobKind::Ocr, 2)]);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let admission = admission.clone();
                std::thread::spawn(move || {
                    let kind = JobKind::ALL[i % 4];
                    for _ in 0..200 {
                        if let Ok(ticket) = admission.acquire(kind) {
                            let snap = admission.snapshot();
                            assert!(snap.running <= 4);
                            assert!(snap.per_kind[&JobKind::Ocr].running <= 2);
                            drop(ticket);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admission.running_total(), 0);
    }
}
