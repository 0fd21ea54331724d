//! Provider gateway for OpenRouter chat completions.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{CallFailure, ProviderError};
pub use pricing::*;
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// What the council needs from a model provider.
///
/// `query` never raises a transport-level error type: every failure comes
/// back as a tagged [`CallFailure`].
#[async_trait::async_trait]
pub trait ModelGateway: Send + Sync {
    async fn query(&self, req: ChatRequest) -> Result<ModelCallResult, CallFailure>;

    /// Billed cost in nanodollars for a generation, `None` if not (yet) known.
    async fn fetch_actual_cost(&self, generation_id: &str) -> Option<i64>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Cap on simultaneous outbound calls across all jobs.
    pub max_concurrent_calls: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 16,
        }
    }
}

/// Shared gateway: per-call timeouts, bounded concurrency, usage recording.
///
/// Failed calls are not retried.
pub struct ProviderGateway<U: UsageSinkTrait, P: ChatProvider = OpenRouterAdapter> {
    provider: P,
    usage_sink: Arc<U>,
    permits: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait, P: ChatProvider> ModelGateway for ProviderGateway<U, P> {
    async fn query(&self, req: ChatRequest) -> Result<ModelCallResult, CallFailure> {
        ProviderGateway::query(self, req).await
    }

    async fn fetch_actual_cost(&self, generation_id: &str) -> Option<i64> {
        ProviderGateway::fetch_actual_cost(self, generation_id).await
    }
}

impl<U: UsageSinkTrait, P: ChatProvider> ProviderGateway<U, P> {
    pub fn with_config(provider: P, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            permits: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1))),
        }
    }

    pub async fn query(&self, req: ChatRequest) -> Result<ModelCallResult, CallFailure> {
        let start = Instant::now();
        // Waiting for a permit counts against the call's budget.
        let call = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ProviderError::Rejected("gateway closed".into()))?;
            self.provider.chat(&req).await
        };

        let outcome = match tokio::time::timeout(req.timeout, call).await {
            Err(_) => Err(CallFailure::Timeout(req.timeout)),
            Ok(Err(err)) => {
                tracing::debug!(
                    model = %req.model,
                    code = err.code(),
                    request_id = ?err.request_id(),
                    "provider error"
                );
                Err(CallFailure::from_provider(err, req.timeout))
            }
            Ok(Ok(resp)) => {
                if matches!(
                    resp.finish_reason,
                    FinishReason::Length | FinishReason::ContentFilter
                ) {
                    tracing::warn!(
                        model = %req.model,
                        finish_reason = ?resp.finish_reason,
                        "answer cut short by provider"
                    );
                }
                Ok(ModelCallResult::from_response(&req.model, resp))
            }
        };

        self.record_usage(&req, &outcome, start.elapsed()).await;
        outcome
    }

    pub async fn fetch_actual_cost(&self, generation_id: &str) -> Option<i64> {
        match self.provider.generation_cost(generation_id).await {
            Ok(cost) => cost,
            Err(err) => {
                tracing::debug!(
                    generation_id,
                    code = err.code(),
                    error = %err,
                    "generation cost lookup failed"
                );
                None
            }
        }
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        outcome: &Result<ModelCallResult, CallFailure>,
        elapsed: Duration,
    ) {
        self.usage_sink
            .record(ProviderCallRecord::chat("openrouter", req, outcome, elapsed))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Answers only once released.
    struct Stalled(Arc<Notify>);

    #[async_trait]
    impl ChatProvider for Stalled {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.0.notified().await;
            Ok(ChatResponse {
                content: "late".into(),
                usage: TokenUsage::default(),
                generation_id: None,
                cost_nanodollars: 0,
                latency: Duration::ZERO,
                finish_reason: FinishReason::Stop,
            })
        }

        async fn generation_cost(&self, _id: &str) -> Result<Option<i64>, ProviderError> {
            Ok(None)
        }
    }

    fn request(timeout: Duration) -> ChatRequest {
        ChatRequest::new(
            "x-ai/grok-4",
            vec![Message::user("hi")],
            timeout,
            Attribution::new("council::stage1"),
        )
    }

    #[tokio::test]
    async fn waiting_for_a_permit_counts_against_the_timeout() {
        let release = Arc::new(Notify::new());
        let gateway = Arc::new(ProviderGateway::with_config(
            Stalled(Arc::clone(&release)),
            Arc::new(NoopUsageSink),
            GatewayConfig {
                max_concurrent_calls: 1,
            },
        ));

        let holder = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.query(request(Duration::from_secs(30))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let blocked = gateway.query(request(Duration::from_millis(50))).await;
        assert_eq!(blocked, Err(CallFailure::Timeout(Duration::from_millis(50))));
        assert!(started.elapsed() < Duration::from_secs(5));

        release.notify_one();
        let held = holder.await.unwrap().unwrap();
        assert_eq!(held.content, "late");
    }
}
