//! Fixed-size worker pool.
//!
//! A job holds a [`WorkerSlot`] for its whole run, so the number of external
//! tool processes alive at once never exceeds the pool size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerUsage {
    pub size: usize,
    pub busy: usize,
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    size: usize,
}

/// A claimed worker; freed on drop.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            closed: Arc::new(AtomicBool::new(false)),
            size,
        }
    }

    /// Claim a free worker without waiting. `None` if all are busy or the pool is closed.
    pub fn try_claim(&self) -> Option<WorkerSlot> {
        if self.is_closed() {
            return None;
        }
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Some(WorkerSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn usage(&self) -> WorkerUsage {
        WorkerUsage {
            size: self.size,
            busy: self.size.saturating_sub(self.permits.available_permits()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for every worker to go idle. Returns whether it did.
    ///
    /// Close the pool first when draining, or new claims can refill it.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.size).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(acquired) => acquired.is_ok(),
            Err(_) => false,
        }
    }

    /// Stop handing out workers. Running jobs keep theirs.
    ///
    /// The semaphore itself stays open so [`wait_idle`](Self::wait_idle) can
    /// still count returning workers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
