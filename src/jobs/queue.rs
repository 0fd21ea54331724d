//! Task queue seam and the in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    pub job_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is shut down")]
    Closed,
    #[error("job {0} is already queued")]
    Duplicate(Uuid),
}

/// Runs one job to a terminal state. Never returns an error: every outcome
/// is recorded on the job itself.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job_id: Uuid, query: String);
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job_id: Uuid, query: String) -> Result<QueueHandle, QueueError>;

    /// Best effort. True only when the work had not started yet and now
    /// never will.
    async fn cancel(&self, handle: &QueueHandle) -> bool;
}

/// Queue handles of jobs no worker has picked up yet.
///
/// A slot is reserved before enqueueing and released once the job starts or
/// a cancel takes it, so the table only ever holds pending work.
#[derive(Debug, Default)]
pub(crate) struct PendingHandles(Mutex<HashMap<Uuid, Option<QueueHandle>>>);

impl PendingHandles {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Option<QueueHandle>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn reserve(&self, job_id: Uuid) {
        self.lock().insert(job_id, None);
    }

    /// No-op when the slot was released while the job was being enqueued.
    pub(crate) fn fill(&self, handle: QueueHandle) {
        if let Some(slot) = self.lock().get_mut(&handle.job_id) {
            *slot = Some(handle);
        }
    }

    pub(crate) fn release(&self, job_id: Uuid) -> Option<QueueHandle> {
        self.lock().remove(&job_id).flatten()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Runs jobs on tokio tasks, at most `workers` at a time.
pub struct LocalTaskQueue {
    executor: Arc<dyn JobExecutor>,
    workers: Arc<Semaphore>,
    entries: Arc<Mutex<HashMap<Uuid, Arc<AtomicU8>>>>,
}

impl LocalTaskQueue {
    pub fn new(executor: Arc<dyn JobExecutor>, workers: usize) -> Self {
        Self {
            executor,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<AtomicU8>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, job_id: Uuid, query: String) -> Result<QueueHandle, QueueError> {
        let state = Arc::new(AtomicU8::new(QUEUED));
        {
            let mut entries = self.entries();
            if entries.contains_key(&job_id) {
                return Err(QueueError::Duplicate(job_id));
            }
            entries.insert(job_id, Arc::clone(&state));
        }

        let executor = Arc::clone(&self.executor);
        let workers = Arc::clone(&self.workers);
        let entries = Arc::clone(&self.entries);

        tokio::spawn(async move {
            let permit = workers.acquire_owned().await;
            let claimed = permit.is_ok()
                && state
                    .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            if claimed {
                executor.execute(job_id, query).await;
            } else {
                tracing::debug!(job_id = %job_id, "queued job dropped before start");
            }
            drop(permit);
            entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&job_id);
        });

        Ok(QueueHandle { job_id })
    }

    async fn cancel(&self, handle: &QueueHandle) -> bool {
        let Some(state) = self.entries().get(&handle.job_id).cloned() else {
            return false;
        };
        state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
