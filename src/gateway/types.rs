//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for cost tracking and debugging.
///
/// Every request through the gateway carries attribution so usage records
/// can be joined back to the job and the stage that issued them.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Job this request is part of.
    pub job_id: Option<Uuid>,
    /// Which code path made this call, e.g. "council::stage1".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_job_opt(mut self, job_id: Option<Uuid>) -> Self {
        self.job_id = job_id;
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request for one model query.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// OpenRouter model identifier, e.g. "openai/gpt-5.1".
    pub model: String,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Independent timeout for this call.
    pub timeout: Duration,
    /// Sampling temperature; provider default when unset.
    pub temperature: Option<f32>,
    /// Generation cap; unset leaves it to the provider.
    pub max_tokens: Option<u32>,
    /// Attribution for cost tracking.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(
        model: impl Into<String>,
        messages: Vec<Message>,
        timeout: Duration,
        attribution: Attribution,
    ) -> Self {
        Self {
            model: model.into(),
            messages,
            timeout,
            temperature: None,
            max_tokens: None,
            attribution,
        }
    }

    pub fn temperature_opt(mut self, t: Option<f32>) -> Self {
        self.temperature = t;
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Cut off at the token limit.
    Length,
    ContentFilter,
    Other(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") | None => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Raw response from the OpenRouter adapter.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated content.
    pub content: String,
    /// Token usage.
    pub usage: TokenUsage,
    /// Provider-assigned generation id, used for the actual-cost lookup.
    pub generation_id: Option<String>,
    /// Estimated cost in nanodollars, from the pricing registry.
    pub cost_nanodollars: i64,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

// =============================================================================
// COUNCIL-FACING RESULT
// =============================================================================

/// Whether a cost is the immediate token-based estimate or the billed amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostStatus {
    #[default]
    Estimated,
    Actual,
}

/// Outcome of one successful model invocation.
///
/// Failed calls never produce a `ModelCallResult`; they surface as a
/// [`super::CallFailure`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCallResult {
    pub model: String,
    pub content: String,
    pub usage: TokenUsage,
    /// Cost in nanodollars.
    pub cost_nanodollars: i64,
    pub cost_status: CostStatus,
    pub generation_id: Option<String>,
    pub latency_ms: u64,
}

impl ModelCallResult {
    pub fn from_response(model: impl Into<String>, resp: ChatResponse) -> Self {
        Self {
            model: model.into(),
            content: resp.content,
            usage: resp.usage,
            cost_nanodollars: resp.cost_nanodollars,
            cost_status: CostStatus::Estimated,
            generation_id: resp.generation_id,
            latency_ms: resp.latency.as_millis() as u64,
        }
    }
}
