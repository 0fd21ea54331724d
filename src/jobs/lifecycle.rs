//! JobLifecycleManager: the only writer of job status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::council::CouncilResult;
use crate::store::StoreError;

use super::types::{Job, JobState, JobStatus, Transition};

/// Attempts at a compare-and-set write before reporting a conflict.
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("job {0} kept changing during update")]
    Conflict(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Overwrite the stored job only if its status is still `expected`.
    /// Returns whether the write happened.
    async fn replace(&self, job: &Job, expected: JobStatus) -> Result<bool, StoreError>;

    /// Most recently created first.
    async fn list(&self, limit: usize) -> Result<Vec<Job>, StoreError>;
}

/// In-process job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn replace(&self, job: &Job, expected: JobStatus) -> Result<bool, StoreError> {
        let mut jobs = self.lock();
        match jobs.get_mut(&job.id) {
            Some(current) if current.status() == expected => {
                *current = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

/// Owns the job state machine. Every externally visible status change goes
/// through here.
#[derive(Clone)]
pub struct JobLifecycleManager {
    store: Arc<dyn JobStore>,
}

impl JobLifecycleManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        query: impl Into<String>,
        conversation_id: Option<String>,
    ) -> Result<Job, JobError> {
        let job = Job::new(query, conversation_id);
        self.store.insert(&job).await?;
        tracing::info!(job_id = %job.id, "job created");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, JobError> {
        self.store.get(id).await?.ok_or(JobError::NotFound(id))
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list(limit).await?)
    }

    pub async fn start(&self, id: Uuid) -> Result<Job, JobError> {
        self.transition(id, Transition::Start).await
    }

    pub async fn complete(&self, id: Uuid, result: CouncilResult) -> Result<Job, JobError> {
        self.transition(id, Transition::Complete(Box::new(result))).await
    }

    pub async fn fail(&self, id: Uuid, error: impl Into<String>) -> Result<Job, JobError> {
        self.transition(id, Transition::Fail(error.into())).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Job, JobError> {
        self.transition(id, Transition::Cancel).await
    }

    /// Cancel only while no worker has claimed the job.
    pub async fn cancel_pending(&self, id: Uuid) -> Result<Job, JobError> {
        let job = self.get(id).await?;
        let from = job.status();
        let to = JobStatus::Cancelled;
        if from != JobStatus::Pending {
            return Err(JobError::InvalidTransition { from, to });
        }
        let Some(state) = Transition::Cancel.apply(&job, Utc::now()) else {
            return Err(JobError::InvalidTransition { from, to });
        };
        let next = Job { state, ..job };

        if self.store.replace(&next, JobStatus::Pending).await? {
            tracing::info!(job_id = %id, %from, %to, "job transition");
            return Ok(next);
        }
        let from = self.get(id).await?.status();
        Err(JobError::InvalidTransition { from, to })
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Job, JobError> {
        let to = transition.target();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.get(id).await?;
            let from = job.status();
            let Some(state) = transition.clone().apply(&job, Utc::now()) else {
                return Err(JobError::InvalidTransition { from, to });
            };
            let next = Job { state, ..job };

            if self.store.replace(&next, from).await? {
                match next.error() {
                    Some(error) if to == JobStatus::Failed => {
                        tracing::warn!(job_id = %id, %from, %to, error, "job transition")
                    }
                    _ => tracing::info!(job_id = %id, %from, %to, "job transition"),
                }
                return Ok(next);
            }
            tracing::debug!(
                job_id = %id,
                %from,
                %to,
                "job changed underneath transition; retrying"
            );
        }

        Err(JobError::Conflict(id))
    }

    /// Replace the result of a completed job. Status and timestamps are
    /// untouched.
    pub async fn update_result(&self, id: Uuid, result: CouncilResult) -> Result<Job, JobError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut job = self.get(id).await?;
            let from = job.status();
            let JobState::Completed { result: stored, .. } = &mut job.state else {
                return Err(JobError::InvalidTransition {
                    from,
                    to: JobStatus::Completed,
                });
            };
            **stored = result.clone();

            if self.store.replace(&job, JobStatus::Completed).await? {
                return Ok(job);
            }
        }
        Err(JobError::Conflict(id))
    }
}
