//! The three-stage council pipeline.
//!
//! ```text
//! query
//!   └─▶ stage 1: every council model answers (concurrent, per-call timeout)
//!         └─▶ stage 2: every council model ranks the anonymized answers
//!               └─▶ stage 3: the chairman synthesizes the final answer
//! ```
//!
//! Stage 1 and stage 2 call failures are soft: the call is dropped from the
//! stage's results and listed in `Metadata::soft_failures`. A stage 3 failure
//! fails the run. Cancellation is polled before each stage; calls already in
//! flight always run to completion.

use std::sync::Arc;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;

use crate::config::{ConfigError, CouncilConfig};
use crate::gateway::{
    Attribution, CallFailure, ChatRequest, Message, ModelCallResult, ModelGateway,
};

use super::labels::LabelMap;
use super::prompts;
use super::ranking::{aggregate, parse_ranking};
use super::types::{CouncilResult, Metadata, RankingResponse, SoftFailure, Stage};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("cancelled before {before}")]
    Cancelled { before: Stage },
    #[error("chairman model {model} failed: {source}")]
    Synthesis { model: String, source: CallFailure },
    #[error("invalid council config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

pub struct StagePipeline {
    gateway: Arc<dyn ModelGateway>,
    rng_seed: Option<u64>,
}

impl StagePipeline {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self {
            gateway,
            rng_seed: None,
        }
    }

    /// Fix the label shuffle, for reproducible runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Run all three stages for `query`.
    ///
    /// `is_cancelled` is polled before stage 1, stage 2 and stage 3.
    pub async fn run<F>(
        &self,
        config: &CouncilConfig,
        query: &str,
        job_id: Option<Uuid>,
        is_cancelled: F,
    ) -> Result<CouncilResult, PipelineError>
    where
        F: Fn() -> bool + Send + Sync,
    {
        config.validate()?;
        let mut metadata = Metadata::default();

        checkpoint(&is_cancelled, Stage::Stage1, job_id)?;
        let stage1 = self.collect(config, query, job_id, &mut metadata).await;
        tracing::info!(
            job_id = ?job_id,
            answered = stage1.len(),
            asked = config.council_models.len(),
            "stage1 complete"
        );

        checkpoint(&is_cancelled, Stage::Stage2, job_id)?;
        let survivors: Vec<String> = stage1.iter().map(|r| r.model.clone()).collect();
        let labels = match self.rng_seed {
            Some(seed) => LabelMap::assign(&survivors, &mut StdRng::seed_from_u64(seed)),
            None => LabelMap::assign(&survivors, &mut StdRng::from_entropy()),
        };
        let stage2 = self
            .rank(config, query, job_id, &labels, &stage1, &mut metadata)
            .await;
        let aggregate_ranking = aggregate(&labels, &stage2);
        tracing::info!(
            job_id = ?job_id,
            labels = labels.len(),
            rankings = stage2.len(),
            "stage2 complete"
        );

        checkpoint(&is_cancelled, Stage::Stage3, job_id)?;
        let messages = prompts::stage3_messages(query, &stage1, &aggregate_ranking);
        let stage3 = self
            .call(config, &config.chairman_model, messages, Stage::Stage3, job_id)
            .await
            .map_err(|source| PipelineError::Synthesis {
                model: config.chairman_model.clone(),
                source,
            })?;
        metadata.record_call(Stage::Stage3, &stage3);

        metadata.label_to_model = labels.to_btree();
        metadata.aggregate_ranking = aggregate_ranking;
        metadata.recompute_costs();
        tracing::info!(
            job_id = ?job_id,
            total_nanos = metadata.stage_costs.total,
            soft_failures = metadata.soft_failures.len(),
            "council complete"
        );

        Ok(CouncilResult {
            stage1,
            stage2,
            stage3,
            metadata,
        })
    }

    async fn collect(
        &self,
        config: &CouncilConfig,
        query: &str,
        job_id: Option<Uuid>,
        metadata: &mut Metadata,
    ) -> Vec<ModelCallResult> {
        let calls = config.council_models.iter().map(|model| {
            self.call(
                config,
                model,
                prompts::stage1_messages(query),
                Stage::Stage1,
                job_id,
            )
        });
        let outcomes = join_all(calls).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (model, outcome) in config.council_models.iter().zip(outcomes) {
            match outcome {
                Ok(result) => {
                    metadata.record_call(Stage::Stage1, &result);
                    results.push(result);
                }
                Err(failure) => soft_fail(
                    metadata,
                    Stage::Stage1,
                    model,
                    job_id,
                    failure.code(),
                    &failure,
                ),
            }
        }
        results
    }

    async fn rank(
        &self,
        config: &CouncilConfig,
        query: &str,
        job_id: Option<Uuid>,
        labels: &LabelMap,
        stage1: &[ModelCallResult],
        metadata: &mut Metadata,
    ) -> Vec<RankingResponse> {
        if labels.is_empty() {
            tracing::warn!(job_id = ?job_id, "no stage1 answers; skipping ranking calls");
            return Vec::new();
        }

        let messages = prompts::stage2_messages(query, labels, stage1);
        let calls = config
            .council_models
            .iter()
            .map(|model| self.call(config, model, messages.clone(), Stage::Stage2, job_id));
        let outcomes = join_all(calls).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (model, outcome) in config.council_models.iter().zip(outcomes) {
            let call = match outcome {
                Ok(call) => call,
                Err(failure) => {
                    soft_fail(metadata, Stage::Stage2, model, job_id, failure.code(), &failure);
                    continue;
                }
            };
            // Billed whether or not the ranking is usable.
            metadata.record_call(Stage::Stage2, &call);
            match parse_ranking(&call.content, labels) {
                Ok(ranking) => results.push(RankingResponse { call, ranking }),
                Err(err) => soft_fail(
                    metadata,
                    Stage::Stage2,
                    model,
                    job_id,
                    "unparseable_ranking",
                    &err,
                ),
            }
        }
        results
    }

    async fn call(
        &self,
        config: &CouncilConfig,
        model: &str,
        messages: Vec<Message>,
        stage: Stage,
        job_id: Option<Uuid>,
    ) -> Result<ModelCallResult, CallFailure> {
        let req = ChatRequest::new(
            model,
            messages,
            config.call_timeout(),
            Attribution::new(stage.caller()).with_job_opt(job_id),
        )
        .temperature_opt(config.temperature);
        self.gateway.query(req).await
    }
}

fn checkpoint<F: Fn() -> bool>(
    is_cancelled: &F,
    before: Stage,
    job_id: Option<Uuid>,
) -> Result<(), PipelineError> {
    if is_cancelled() {
        tracing::info!(job_id = ?job_id, %before, "cancellation observed");
        return Err(PipelineError::Cancelled { before });
    }
    Ok(())
}

fn soft_fail(
    metadata: &mut Metadata,
    stage: Stage,
    model: &str,
    job_id: Option<Uuid>,
    reason: &str,
    detail: &dyn std::fmt::Display,
) {
    tracing::warn!(
        job_id = ?job_id,
        %stage,
        model,
        reason,
        error = %detail,
        "model call excluded"
    );
    metadata.soft_failures.push(SoftFailure {
        stage,
        model: model.to_string(),
        reason: reason.to_string(),
        detail: detail.to_string(),
    });
}
