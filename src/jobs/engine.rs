//! CouncilEngine: submission, status and cancellation for callers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ConfigProvider;
use crate::conversation::ConversationStore;
use crate::council::{generate_title, StagePipeline};
use crate::gateway::ModelGateway;
use crate::store::StoreError;

use super::cancel::CancellationRegistry;
use super::lifecycle::{JobError, JobLifecycleManager, JobStore};
use super::queue::{JobExecutor, LocalTaskQueue, PendingHandles, QueueError, TaskQueue};
use super::reconcile::{CostReconciler, DEFAULT_GRACE};
use super::types::{Job, JobStatus};
use super::worker::JobWorker;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRejection {
    NotFound,
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The flag is set. A pending job is cancelled at once; a running job
    /// stops at its next stage boundary, or completes if synthesis already
    /// started.
    Accepted,
    Rejected(CancelRejection),
}

pub struct CouncilEngine {
    manager: JobLifecycleManager,
    gateway: Arc<dyn ModelGateway>,
    config: Arc<dyn ConfigProvider>,
    queue: Arc<dyn TaskQueue>,
    cancellations: CancellationRegistry,
    conversations: Option<Arc<dyn ConversationStore>>,
    reconciler: Arc<CostReconciler>,
    handles: Arc<PendingHandles>,
    /// Title generation tasks.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CouncilEngine {
    pub fn builder(
        gateway: Arc<dyn ModelGateway>,
        config: Arc<dyn ConfigProvider>,
        jobs: Arc<dyn JobStore>,
    ) -> EngineBuilder {
        EngineBuilder {
            gateway,
            config,
            jobs,
            conversations: None,
            workers: 4,
            reconcile_grace: DEFAULT_GRACE,
            reconcile: true,
            rng_seed: None,
        }
    }

    pub fn jobs(&self) -> &JobLifecycleManager {
        &self.manager
    }

    pub fn reconciler(&self) -> &Arc<CostReconciler> {
        &self.reconciler
    }

    fn background(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a pending job and queue it.
    pub async fn submit(&self, query: impl Into<String>) -> Result<Uuid, EngineError> {
        self.submit_job(query.into(), None).await
    }

    /// Like [`submit`](Self::submit), recording the user turn in
    /// `conversation_id`. The first question of a conversation also names it.
    pub async fn submit_in_conversation(
        &self,
        query: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Result<Uuid, EngineError> {
        self.submit_job(query.into(), Some(conversation_id.into())).await
    }

    async fn submit_job(
        &self,
        query: String,
        conversation_id: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let job = self.manager.create(query.clone(), conversation_id).await?;

        if let (Some(store), Some(conversation_id)) = (&self.conversations, &job.conversation_id) {
            let first = store
                .get_conversation(conversation_id)
                .await?
                .map_or(true, |c| c.turns.is_empty());
            store.append_user_turn(conversation_id, &query).await?;
            if first {
                self.spawn_title(Arc::clone(store), conversation_id.clone(), query.clone());
            }
        }

        self.handles.reserve(job.id);
        match self.queue.enqueue(job.id, query).await {
            Ok(handle) => {
                self.handles.fill(handle);
                Ok(job.id)
            }
            Err(err) => {
                self.handles.release(job.id);
                if let Err(fail_err) = self.manager.fail(job.id, "could not enqueue job").await {
                    tracing::error!(
                        job_id = %job.id,
                        error = %fail_err,
                        "could not fail unqueued job"
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Name the conversation after its first question. Failures keep the
    /// default title.
    fn spawn_title(
        &self,
        store: Arc<dyn ConversationStore>,
        conversation_id: String,
        query: String,
    ) {
        let gateway = Arc::clone(&self.gateway);
        let config = Arc::clone(&self.config);
        let task = tokio::spawn(async move {
            let config = match config.load() {
                Ok(config) if !config.title_model.trim().is_empty() => config,
                Ok(_) => return,
                Err(err) => {
                    tracing::debug!(%conversation_id, error = %err, "no config for title");
                    return;
                }
            };
            let timeout = config.call_timeout();
            match generate_title(gateway.as_ref(), &config.title_model, &query, timeout).await {
                Ok(title) => match store.set_title(&conversation_id, &title).await {
                    Ok(()) => tracing::info!(%conversation_id, %title, "conversation titled"),
                    Err(err) => {
                        tracing::warn!(%conversation_id, error = %err, "could not store title")
                    }
                },
                Err(failure) => tracing::warn!(
                    %conversation_id,
                    code = failure.code(),
                    error = %failure,
                    "title generation failed"
                ),
            }
        });

        let mut background = self.background();
        background.retain(|h| !h.is_finished());
        background.push(task);
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<Job, EngineError> {
        Ok(self.manager.get(job_id).await?)
    }

    pub async fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome, EngineError> {
        let job = match self.manager.get(job_id).await {
            Ok(job) => job,
            Err(JobError::NotFound(_)) => {
                return Ok(CancelOutcome::Rejected(CancelRejection::NotFound))
            }
            Err(err) => return Err(err.into()),
        };
        let status = job.status();
        if status.is_terminal() {
            return Ok(CancelOutcome::Rejected(CancelRejection::AlreadyTerminal(status)));
        }

        self.cancellations.cancel(job_id);
        tracing::info!(job_id = %job_id, %status, "cancel requested");

        if status == JobStatus::Pending {
            if let Some(handle) = self.handles.release(job_id) {
                self.queue.cancel(&handle).await;
            }
            // Loses to a worker that already started; that worker sees the
            // flag at its first checkpoint.
            match self.manager.cancel_pending(job_id).await {
                Ok(_) => {}
                Err(JobError::InvalidTransition { from, .. })
                    if matches!(from, JobStatus::Completed | JobStatus::Failed) =>
                {
                    return Ok(CancelOutcome::Rejected(CancelRejection::AlreadyTerminal(from)));
                }
                Err(JobError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(CancelOutcome::Accepted)
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for_terminal(
        &self,
        job_id: Uuid,
        poll_interval: Duration,
    ) -> Result<Job, EngineError> {
        loop {
            let job = self.manager.get(job_id).await?;
            if job.status().is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Wait for title generation and scheduled cost reconciliation.
    pub async fn wait_idle(&self) {
        let tasks = std::mem::take(&mut *self.background());
        for task in tasks {
            let _ = task.await;
        }
        self.reconciler.wait_idle().await;
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, EngineError> {
        Ok(self.manager.list(limit).await?)
    }
}

pub struct EngineBuilder {
    gateway: Arc<dyn ModelGateway>,
    config: Arc<dyn ConfigProvider>,
    jobs: Arc<dyn JobStore>,
    conversations: Option<Arc<dyn ConversationStore>>,
    workers: usize,
    reconcile_grace: Duration,
    reconcile: bool,
    rng_seed: Option<u64>,
}

impl EngineBuilder {
    pub fn conversations(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    /// Jobs run concurrently by the local queue (default: 4).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn reconcile_grace(mut self, grace: Duration) -> Self {
        self.reconcile_grace = grace;
        self
    }

    /// Schedule cost reconciliation after each completed job (default: on).
    pub fn reconcile(mut self, enabled: bool) -> Self {
        self.reconcile = enabled;
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build with the in-process [`LocalTaskQueue`].
    pub fn build(self) -> CouncilEngine {
        let workers = self.workers;
        self.build_with_queue(|executor| Arc::new(LocalTaskQueue::new(executor, workers)))
    }

    /// Build with a custom queue around the engine's executor.
    pub fn build_with_queue<F>(self, make_queue: F) -> CouncilEngine
    where
        F: FnOnce(Arc<dyn JobExecutor>) -> Arc<dyn TaskQueue>,
    {
        let manager = JobLifecycleManager::new(self.jobs);
        let cancellations = CancellationRegistry::new();

        let reconciler = Arc::new(
            CostReconciler::new(
                Arc::clone(&self.gateway),
                manager.clone(),
                self.conversations.clone(),
            )
            .with_grace(self.reconcile_grace),
        );

        let mut pipeline = StagePipeline::new(Arc::clone(&self.gateway));
        if let Some(seed) = self.rng_seed {
            pipeline = pipeline.with_rng_seed(seed);
        }

        let handles = Arc::new(PendingHandles::default());
        let worker = JobWorker {
            manager: manager.clone(),
            pipeline: Arc::new(pipeline),
            config: Arc::clone(&self.config),
            cancellations: cancellations.clone(),
            conversations: self.conversations.clone(),
            handles: Arc::clone(&handles),
            reconciler: self.reconcile.then(|| Arc::clone(&reconciler)),
        };

        CouncilEngine {
            manager,
            gateway: self.gateway,
            config: self.config,
            queue: make_queue(Arc::new(worker)),
            cancellations,
            conversations: self.conversations,
            reconciler,
            handles,
            background: Mutex::new(Vec::new()),
        }
    }
}
