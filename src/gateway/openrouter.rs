//! OpenRouter adapter: chat completions and billed-cost lookups.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::pricing::{chat_cost, usd_to_nanodollars};
use super::types::*;

/// Anything that can answer a chat request and report billed costs.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Billed cost of a finished generation in nanodollars, `None` while the
    /// provider has not finalized it.
    async fn generation_cost(&self, generation_id: &str) -> Result<Option<i64>, ProviderError>;
}

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Client-wide ceiling; each call also carries its own budget.
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Response bodies above 1 MiB are refused.
const MAX_RESPONSE_BYTES: usize = 1_024 * 1_024;

/// Roughly 125k tokens of prompt.
const MAX_INPUT_CHARS: usize = 500_000;

const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 16;

const GENERATION_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloning shares the underlying `reqwest::Client` and its pool.
#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenRouterAdapter {
    /// Reads `OPENROUTER_API_KEY` (required), `OPENROUTER_BASE_URL`,
    /// `OPENROUTER_TIMEOUT_SECONDS`, `OPENROUTER_REFERER` and
    /// `OPENROUTER_APP_TITLE`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::Config("OPENROUTER_API_KEY not set".into()))?;
        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CLIENT_TIMEOUT);

        Self::with_config(
            api_key,
            base_url,
            timeout,
            std::env::var("OPENROUTER_REFERER").ok(),
            std::env::var("OPENROUTER_APP_TITLE").ok(),
        )
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::Config("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);

        // Attribution headers are optional; unusable values are dropped.
        for (name, value) in [("HTTP-Referer", referer), ("X-Title", app_title)] {
            if let Some(v) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(name, v);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::Config(format!("could not build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    /// Ask OpenRouter to include usage accounting in the response.
    usage: UsageOptions,
}

#[derive(Serialize)]
struct UsageOptions {
    include: bool,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    id: Option<String>,
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GenerationApiResponse {
    data: Option<GenerationData>,
}

#[derive(Deserialize)]
struct GenerationData {
    total_cost: Option<f64>,
}

// =============================================================================
// RESPONSE HANDLING
// =============================================================================

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Error for a non-2xx answer, preferring the provider's own message.
fn status_error(status: u16, body: &str, request_id: Option<String>) -> ProviderError {
    let api_error = serde_json::from_str::<ChatApiResponse>(body)
        .ok()
        .and_then(|parsed| parsed.error);
    let (message, provider_code) = match api_error {
        Some(ApiError { message, code }) => (
            message.unwrap_or_else(|| format!("HTTP {status}")),
            code.and_then(|c| match c {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
        ),
        None => (format!("HTTP {status}"), None),
    };
    ProviderError::Status {
        status,
        message,
        provider_code,
        request_id,
    }
}

/// Turn a 2xx body into a [`ChatResponse`]. Blank content counts as unusable.
fn parse_chat_body(
    model: &str,
    body: &str,
    request_id: Option<&str>,
    latency: Duration,
) -> Result<ChatResponse, ProviderError> {
    let parsed: ChatApiResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::body(format!("invalid JSON: {e}"), request_id))?;

    if let Some(error) = parsed.error {
        return Err(ProviderError::body(
            error.message.unwrap_or_else(|| "error in 2xx body".into()),
            request_id,
        ));
    }

    let choice = parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| ProviderError::body("no choices in response", request_id))?;
    let content = choice.message.and_then(|m| m.content).unwrap_or_default();
    if content.trim().is_empty() {
        return Err(ProviderError::body("empty content in response", request_id));
    }

    // No usage block still leaves a usable answer; it is simply priced at zero.
    let usage = parsed.usage.unwrap_or_default();
    let prompt_tokens = usage.prompt_tokens.unwrap_or(0);
    let completion_tokens = usage.completion_tokens.unwrap_or(0);
    let total_tokens = usage
        .total_tokens
        .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens));

    Ok(ChatResponse {
        content,
        usage: TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        },
        generation_id: parsed.id.filter(|id| !id.is_empty()),
        cost_nanodollars: chat_cost(model, prompt_tokens, completion_tokens),
        latency,
        finish_reason: FinishReason::from(choice.finish_reason),
    })
}

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let input_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if input_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::Rejected(format!(
                "input too large: {input_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();
        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            usage: UsageOptions { include: true },
        };

        let mut response = self
            .client
            .post(self.url("chat/completions"))
            .timeout(req.timeout)
            .json(&api_req)
            .send()
            .await?;

        let status = response.status().as_u16();
        let request_id = request_id(response.headers());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(ProviderError::body(
                    format!("response larger than {MAX_RESPONSE_BYTES} bytes"),
                    request_id.as_deref(),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes);

        if !(200..300).contains(&status) {
            return Err(status_error(status, &body, request_id));
        }
        parse_chat_body(&req.model, &body, request_id.as_deref(), start.elapsed())
    }

    async fn generation_cost(&self, generation_id: &str) -> Result<Option<i64>, ProviderError> {
        if generation_id.is_empty() {
            return Ok(None);
        }

        let response = self
            .client
            .get(self.url("generation"))
            .query(&[("id", generation_id)])
            .timeout(GENERATION_LOOKUP_TIMEOUT)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 404 {
            // Not finalized yet.
            return Ok(None);
        }
        if !(200..300).contains(&status) {
            return Err(ProviderError::Status {
                status,
                message: "generation lookup failed".into(),
                provider_code: None,
                request_id: request_id(response.headers()),
            });
        }

        let parsed: GenerationApiResponse = response.json().await?;
        Ok(parsed
            .data
            .and_then(|d| d.total_cost)
            .map(usd_to_nanodollars)
            .filter(|nanos| *nanos > 0))
    }
}
