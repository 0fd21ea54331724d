//! CostReconciler: upgrades estimated costs to billed costs after completion.
//!
//! Runs detached from the job. Nothing here can change a job's status, and
//! every failure is logged and dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::conversation::ConversationStore;
use crate::gateway::ModelGateway;
use crate::store::StoreError;

use super::lifecycle::{JobError, JobLifecycleManager};

/// Default wait for the provider to finalize billing.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The provider reported no billed cost for any generation.
    NoActualCosts,
    /// The job is not in `completed`.
    JobUnavailable,
    /// Billed costs already applied to the job and its conversation.
    Unchanged,
    /// `delta_nanodollars` is the change to the job total; zero when only a
    /// lagging conversation was brought up to date.
    Updated {
        total_nanodollars: i64,
        delta_nanodollars: i64,
    },
}

pub struct CostReconciler {
    gateway: Arc<dyn ModelGateway>,
    manager: JobLifecycleManager,
    conversations: Option<Arc<dyn ConversationStore>>,
    grace: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CostReconciler {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        manager: JobLifecycleManager,
        conversations: Option<Arc<dyn ConversationStore>>,
    ) -> Self {
        Self {
            gateway,
            manager,
            conversations,
            grace: DEFAULT_GRACE,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Reconcile in the background once `ready` fires, after the grace
    /// period. Dropping the sender abandons the run.
    ///
    /// The task is tracked from this call on, so [`wait_idle`](Self::wait_idle)
    /// covers it even before the job is visibly completed.
    pub fn schedule(
        self: &Arc<Self>,
        job_id: Uuid,
        generation_ids: BTreeMap<String, String>,
        ready: oneshot::Receiver<()>,
    ) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if ready.await.is_err() {
                tracing::debug!(job_id = %job_id, "job not completed; skipping reconciliation");
                return;
            }
            tokio::time::sleep(this.grace).await;
            match this.reconcile(job_id, &generation_ids).await {
                Ok(outcome) => {
                    tracing::info!(job_id = %job_id, ?outcome, "cost reconciliation finished")
                }
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "cost reconciliation failed")
                }
            }
        });

        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Wait for every scheduled reconciliation to finish.
    pub async fn wait_idle(&self) {
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Look up billed costs now and fold them into the job result.
    ///
    /// Totals are recomputed from the per-call ledger, so repeated runs with
    /// the same billed costs leave the job and the conversation unchanged.
    pub async fn reconcile(
        &self,
        job_id: Uuid,
        generation_ids: &BTreeMap<String, String>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if generation_ids.is_empty() {
            return Ok(ReconcileOutcome::NoActualCosts);
        }

        let lookups = generation_ids.iter().map(|(key, id)| async move {
            (key.clone(), self.gateway.fetch_actual_cost(id).await)
        });
        let actual: HashMap<String, i64> = join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(key, cost)| cost.map(|c| (key, c)))
            .collect();

        if actual.is_empty() {
            tracing::debug!(job_id = %job_id, "no billed costs available yet");
            return Ok(ReconcileOutcome::NoActualCosts);
        }

        let job = self.manager.get(job_id).await?;
        let Some(result) = job.result() else {
            return Ok(ReconcileOutcome::JobUnavailable);
        };

        let before = result.total_cost();
        let mut updated = result.clone();
        let job_changed = updated.apply_actual_costs(&actual);
        if job_changed {
            self.manager.update_result(job_id, updated.clone()).await?;
        }
        let total = updated.total_cost();
        let delta = total - before;

        // The stored turn is compared against the job on every run, so a
        // conversation write lost after the job was updated catches up later.
        let mut conversation_delta = 0;
        if let (Some(store), Some(conversation_id)) = (&self.conversations, &job.conversation_id) {
            conversation_delta = store
                .update_assistant_turn(conversation_id, job_id, &updated)
                .await?
                .unwrap_or(0);
        }

        if !job_changed && conversation_delta == 0 {
            return Ok(ReconcileOutcome::Unchanged);
        }

        tracing::info!(
            job_id = %job_id,
            actual_calls = actual.len(),
            total_nanos = total,
            delta_nanos = delta,
            conversation_delta_nanos = conversation_delta,
            "applied billed costs"
        );

        Ok(ReconcileOutcome::Updated {
            total_nanodollars: total,
            delta_nanodollars: delta,
        })
    }
}
