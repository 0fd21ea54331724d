//! Cooperative cancellation flags keyed by job id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// Poll-able flag for one job. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Shared map of cancellation flags.
///
/// Polling never blocks on I/O. Flags have no unset operation; a job id that
/// was never seen reads as not cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    flags: Arc<Mutex<HashMap<Uuid, CancellationSignal>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationSignal>> {
        self.flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Signal for `job_id`, created unset on first use.
    pub fn signal(&self, job_id: Uuid) -> CancellationSignal {
        self.lock().entry(job_id).or_default().clone()
    }

    pub fn cancel(&self, job_id: Uuid) {
        self.signal(job_id).cancel();
    }

    pub fn is_cancelled(&self, job_id: Uuid) -> bool {
        self.lock()
            .get(&job_id)
            .is_some_and(CancellationSignal::is_cancelled)
    }

    /// Forget a finished job's flag unless it was cancelled.
    pub fn release(&self, job_id: Uuid) {
        let mut flags = self.lock();
        if flags.get(&job_id).is_some_and(|s| !s.is_cancelled()) {
            flags.remove(&job_id);
        }
    }
}
