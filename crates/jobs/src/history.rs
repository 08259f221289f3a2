use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;

use serde::Serialize;

use convertd_core::JobRecord;

pub const DEFAULT_HISTORY: usize = 200;

/// Bounded log of finished jobs plus lifetime totals per terminal state.
pub struct JobHistory {
    capacity: usize,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    recent: VecDeque<JobRecord>,
    totals: BTreeMap<&'static str, u64>,
}

/// Lifetime counts by terminal state name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobTotals(pub BTreeMap<&'static str, u64>);

impl JobHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn push(&self, record: JobRecord) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        *inner.totals.entry(record.state.as_str()).or_default() += 1;
        if inner.recent.len() == self.capacity {
            inner.recent.pop_front();
        }
        inner.recent.push_back(record);
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<JobRecord> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn totals(&self) -> JobTotals {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        JobTotals(inner.totals.clone())
    }
}

impl Default for JobHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}
