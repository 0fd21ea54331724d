//! Executes one queued job: drives the lifecycle around a pipeline run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::ConfigProvider;
use crate::conversation::ConversationStore;
use crate::council::{CouncilResult, PipelineError, StagePipeline};

use super::cancel::CancellationRegistry;
use super::lifecycle::{JobError, JobLifecycleManager};
use super::queue::{JobExecutor, PendingHandles};
use super::reconcile::CostReconciler;
use super::types::Job;

/// Error stored on a job whose pipeline run panicked.
pub const INTERNAL_ERROR: &str = "internal error while processing job";

pub struct JobWorker {
    pub(crate) manager: JobLifecycleManager,
    pub(crate) pipeline: Arc<StagePipeline>,
    pub(crate) config: Arc<dyn ConfigProvider>,
    pub(crate) cancellations: CancellationRegistry,
    pub(crate) conversations: Option<Arc<dyn ConversationStore>>,
    pub(crate) handles: Arc<PendingHandles>,
    /// Scheduled after every completed job when set.
    pub(crate) reconciler: Option<Arc<CostReconciler>>,
}

#[async_trait]
impl JobExecutor for JobWorker {
    async fn execute(&self, job_id: Uuid, query: String) {
        self.handles.release(job_id);
        self.run(job_id, &query).await;
        self.cancellations.release(job_id);
    }
}

impl JobWorker {
    async fn run(&self, job_id: Uuid, query: &str) {
        let signal = self.cancellations.signal(job_id);
        if signal.is_cancelled() {
            match self.manager.cancel(job_id).await {
                Err(JobError::InvalidTransition { from, .. }) => {
                    tracing::debug!(job_id = %job_id, %from, "cancelled before start");
                }
                outcome => self.settle(job_id, outcome),
            }
            return;
        }

        match self.manager.start(job_id).await {
            Ok(_) => {}
            Err(JobError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id = %job_id, %from, "job no longer pending; skipping");
                return;
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "could not start job");
                return;
            }
        }

        // Configuration is read once, before any stage runs.
        let config = match self.config.load() {
            Ok(config) => config,
            Err(err) => {
                let outcome = self
                    .manager
                    .fail(job_id, format!("invalid council config: {err}"))
                    .await;
                self.settle(job_id, outcome);
                return;
            }
        };

        let run = self
            .pipeline
            .run(&config, query, Some(job_id), || signal.is_cancelled());

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(result)) => self.finish(job_id, result).await,
            Ok(Err(PipelineError::Cancelled { .. })) => {
                self.settle(job_id, self.manager.cancel(job_id).await)
            }
            Ok(Err(err)) => self.settle(job_id, self.manager.fail(job_id, err.to_string()).await),
            Err(_) => {
                tracing::error!(job_id = %job_id, "pipeline panicked");
                self.settle(job_id, self.manager.fail(job_id, INTERNAL_ERROR).await)
            }
        }
    }

    async fn finish(&self, job_id: Uuid, result: CouncilResult) {
        let generation_ids = result.metadata.generation_ids.clone();
        let total = result.total_cost();

        // Registered before completion so waiters never miss it.
        let (ready, ready_rx) = oneshot::channel();
        if let Some(reconciler) = &self.reconciler {
            reconciler.schedule(job_id, generation_ids, ready_rx);
        }

        let job = match self.manager.complete(job_id, result).await {
            Ok(job) => job,
            Err(err) => {
                self.settle(job_id, Err(err));
                return;
            }
        };

        if let (Some(store), Some(conversation_id), Some(result)) =
            (&self.conversations, &job.conversation_id, job.result())
        {
            if let Err(err) = store
                .append_assistant_turn(conversation_id, job_id, result)
                .await
            {
                tracing::warn!(
                    job_id = %job_id,
                    %conversation_id,
                    error = %err,
                    "could not persist assistant turn"
                );
            } else if let Err(err) = store.add_cost(conversation_id, total).await {
                tracing::warn!(
                    job_id = %job_id,
                    %conversation_id,
                    error = %err,
                    "could not add conversation cost"
                );
            }
        }

        let _ = ready.send(());
    }

    fn settle(&self, job_id: Uuid, outcome: Result<Job, JobError>) {
        if let Err(err) = outcome {
            tracing::error!(job_id = %job_id, error = %err, "job transition failed");
        }
    }
}
