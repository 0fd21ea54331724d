//! Per-call usage records and the sinks that receive them.
//!
//! Every gateway call produces exactly one [`ProviderCallRecord`], including
//! timeouts and provider errors.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::CallFailure;
use super::types::{ChatRequest, ModelCallResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub model: String,
    /// Attribution caller, e.g. "council::stage2".
    pub caller: &'static str,
    pub job_id: Option<Uuid>,
    pub status: CallStatus,
    /// [`CallFailure::code`] for failed calls.
    pub error_code: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Estimated cost in nanodollars.
    pub cost_nanodollars: i64,
    pub generation_id: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// Record for a finished chat call against `provider`.
    pub fn chat(
        provider: &'static str,
        req: &ChatRequest,
        outcome: &Result<ModelCallResult, CallFailure>,
        elapsed: Duration,
    ) -> Self {
        let mut record = Self {
            provider,
            model: req.model.clone(),
            caller: req.attribution.caller,
            job_id: req.attribution.job_id,
            status: CallStatus::Success,
            error_code: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_nanodollars: 0,
            generation_id: None,
            latency_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        };
        match outcome {
            Ok(result) => {
                record.prompt_tokens = result.usage.prompt_tokens;
                record.completion_tokens = result.usage.completion_tokens;
                record.cost_nanodollars = result.cost_nanodollars;
                record.generation_id = result.generation_id.clone();
            }
            Err(failure) => {
                record.status = CallStatus::Error;
                record.error_code = Some(failure.code().to_string());
            }
        }
        record
    }
}

/// Destination for usage records. Implementations must not fail the call:
/// errors are theirs to log.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// One structured tracing event per call, under the `council::usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match record.status {
            CallStatus::Success => tracing::info!(
                target: "council::usage",
                provider = record.provider,
                model = %record.model,
                caller = record.caller,
                job_id = ?record.job_id,
                generation_id = ?record.generation_id,
                tokens = record.prompt_tokens + record.completion_tokens,
                cost_nanos = record.cost_nanodollars,
                latency_ms = record.latency_ms,
                "provider call"
            ),
            CallStatus::Error => tracing::warn!(
                target: "council::usage",
                provider = record.provider,
                model = %record.model,
                caller = record.caller,
                job_id = ?record.job_id,
                error_code = ?record.error_code,
                latency_ms = record.latency_ms,
                "provider call failed"
            ),
        }
    }
}
