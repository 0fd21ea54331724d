use std::sync::{Arc, Mutex};
use std::time::Duration;

use council_harness::gateway::openrouter::{ChatProvider, OpenRouterAdapter};
use council_harness::gateway::usage::{CallStatus, ProviderCallRecord};
use council_harness::gateway::{
    chat_cost, Attribution, CallFailure, ChatRequest, CostStatus, FinishReason, GatewayConfig,
    Message, ModelGateway, NoopUsageSink, ProviderGateway, UsageSink,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn request(model: &str, timeout: Duration) -> ChatRequest {
    ChatRequest::new(
        model,
        vec![Message::user("What is 2+2?")],
        timeout,
        Attribution::new("test"),
    )
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

#[async_trait::async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[tokio::test]
async fn openrouter_parses_content_usage_and_generation_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-abc123",
            "choices": [{
                "message": { "content": "4" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1000, "completion_tokens": 1000, "total_tokens": 2000 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .chat(&request("openai/gpt-5.1", Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(resp.content, "4");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.usage.total_tokens, 2000);
    assert_eq!(resp.generation_id.as_deref(), Some("gen-abc123"));
    assert_eq!(resp.cost_nanodollars, 11_250_000);
    assert_eq!(resp.cost_nanodollars, chat_cost("openai/gpt-5.1", 1000, 1000));
}

#[tokio::test]
async fn openrouter_sums_tokens_when_total_missing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-1",
            "choices": [{ "message": { "content": "ok" } }],
            "usage": { "prompt_tokens": 7, "completion_tokens": 5 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .chat(&request("unknown/model", Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(resp.usage.total_tokens, 12);
    assert_eq!(resp.cost_nanodollars, chat_cost("unknown/model", 7, 5));
}

#[tokio::test]
async fn gateway_returns_estimated_result() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-xyz",
            "choices": [{ "message": { "content": "four" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12 }
        })))
        .mount(&server)
        .await;

    let sink = Arc::new(CollectingSink::default());
    let gateway =
        ProviderGateway::with_config(adapter(&server), sink.clone(), GatewayConfig::default());
    let job_id = Uuid::new_v4();
    let req = ChatRequest::new(
        "x-ai/grok-4",
        vec![Message::user("hi")],
        Duration::from_secs(5),
        Attribution::new("council::stage1").with_job(job_id),
    );

    let result = ModelGateway::query(&gateway, req).await.unwrap();
    assert_eq!(result.model, "x-ai/grok-4");
    assert_eq!(result.content, "four");
    assert_eq!(result.cost_status, CostStatus::Estimated);
    assert_eq!(result.generation_id.as_deref(), Some("gen-xyz"));

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Success);
    assert_eq!(records[0].job_id, Some(job_id));
    assert_eq!(records[0].caller, "council::stage1");
    assert_eq!(records[0].generation_id.as_deref(), Some("gen-xyz"));
}

#[tokio::test]
async fn gateway_tags_http_errors_and_records_them() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({
            "error": { "message": "upstream unavailable", "code": 502 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(CollectingSink::default());
    let gateway =
        ProviderGateway::with_config(adapter(&server), sink.clone(), GatewayConfig::default());

    let failure = gateway
        .query(request("openai/gpt-5.1", Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert_eq!(
        failure,
        CallFailure::Http {
            status: 502,
            message: "upstream unavailable".into()
        }
    );

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Error);
    assert_eq!(records[0].error_code.as_deref(), Some("http_error"));
}

#[tokio::test]
async fn gateway_tags_rate_limit_as_http_429() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );
    let failure = gateway
        .query(request("openai/gpt-5.1", Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(failure, CallFailure::Http { status: 429, .. }));
}

#[tokio::test]
async fn gateway_enforces_per_call_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({
                    "choices": [{ "message": { "content": "late" } }],
                    "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
                })),
        )
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );
    let failure = gateway
        .query(request("openai/gpt-5.1", Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(failure.code(), "timeout");
}

#[tokio::test]
async fn gateway_tags_empty_content_as_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "   " } }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 0 }
        })))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );
    let failure = gateway
        .query(request("openai/gpt-5.1", Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(failure, CallFailure::Malformed(_)));
}

#[tokio::test]
async fn generation_lookup_reads_total_cost() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/generation"))
        .and(query_param("id", "gen-abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "gen-abc123", "total_cost": 0.00125 }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/generation"))
        .and(query_param("id", "gen-pending"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/generation"))
        .and(query_param("id", "gen-free"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "total_cost": 0 }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/generation"))
        .and(query_param("id", "gen-broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );

    assert_eq!(gateway.fetch_actual_cost("gen-abc123").await, Some(1_250_000));
    assert_eq!(gateway.fetch_actual_cost("gen-pending").await, None);
    assert_eq!(gateway.fetch_actual_cost("gen-free").await, None);
    assert_eq!(gateway.fetch_actual_cost("gen-broken").await, None);
    assert_eq!(gateway.fetch_actual_cost("").await, None);
}

#[tokio::test]
async fn answer_without_usage_survives_at_zero_cost() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "gen-1",
            "choices": [{ "message": { "content": "4" } }]
        })))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );
    let result = gateway
        .query(request("openai/gpt-5.1", Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(result.content, "4");
    assert_eq!(result.cost_nanodollars, 0);
    assert_eq!(result.usage.total_tokens, 0);
    assert_eq!(result.generation_id.as_deref(), Some("gen-1"));
}
