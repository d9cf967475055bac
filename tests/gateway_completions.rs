use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use grouping_grader::gateway::completions::{ChatProvider, CompletionsAdapter};
use grouping_grader::gateway::{
    Attribution, ChatModel, ChatRequest, FinishReason, GatewayConfig, Message, NoopUsageSink,
    Provider, ProviderError, ProviderGateway,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(provider: Provider, server: &MockServer) -> CompletionsAdapter {
    CompletionsAdapter::with_config(provider, "sk-test", server.uri(), Duration::from_secs(5))
        .unwrap()
}

fn request(model: ChatModel) -> ChatRequest {
    ChatRequest::new(model, vec![Message::user("hi")], Attribution::new("test"))
}

#[tokio::test]
async fn openai_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-request-id", "req-42")
                .set_body_json(json!({
                    "choices": [{
                        "message": { "content": "  Task 1:\n- Grade: 4  " },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
                })),
        )
        .mount(&server)
        .await;

    let resp = adapter(Provider::OpenAI, &server)
        .chat(&request(ChatModel::openai("gpt-4o")))
        .await
        .unwrap();
    assert_eq!(resp.content, "Task 1:\n- Grade: 4");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(resp.request_id.as_deref(), Some("req-42"));
    assert_eq!(
        resp.cost_nanodollars,
        grouping_grader::gateway::chat_cost("gpt-4o", 10, 20)
    );
}

#[tokio::test]
async fn perplexity_request_carries_search_parameters() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "model": "llama-3.1-sonar-small-128k-online",
            "top_p": 0.9,
            "frequency_penalty": 1.0,
            "search_recency_filter": "month",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "ok" }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let req = request(ChatModel::default_for(Provider::Perplexity))
        .top_p(0.9)
        .frequency_penalty(1.0)
        .search_recency("month");
    let resp = adapter(Provider::Perplexity, &server).chat(&req).await.unwrap();
    assert_eq!(resp.content, "ok");
    // Usage is optional in the envelope.
    assert_eq!(resp.input_tokens, 0);
}

#[tokio::test]
async fn http_429_is_rate_limited_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(Provider::OpenAI, &server)
        .chat(&request(ChatModel::openai("gpt-4o")))
        .await
        .unwrap_err();
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
            ..
        } => {
            assert_eq!(retry_after, Duration::from_secs(7));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn http_401_is_not_retryable_and_reports_detail() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided", "code": "invalid_api_key" }
        })))
        .mount(&server)
        .await;

    let err = adapter(Provider::OpenAI, &server)
        .chat(&request(ChatModel::openai("gpt-4o")))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.http_status(), Some(401));
    assert!(err.to_string().contains("HTTP 401: Incorrect API key provided"));
}

#[tokio::test]
async fn integer_error_codes_are_kept() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": 400 }
        })))
        .mount(&server)
        .await;

    let err = adapter(Provider::Perplexity, &server)
        .chat(&request(ChatModel::perplexity("nope")))
        .await
        .unwrap_err();
    let ctx = err.context().expect("context");
    assert_eq!(ctx.provider_code.as_deref(), Some("400"));
}

#[tokio::test]
async fn missing_choices_is_a_malformed_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = adapter(Provider::OpenAI, &server)
        .chat(&request(ChatModel::openai("gpt-4o")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::MalformedEnvelope { .. }));
    assert_eq!(err.code(), "malformed_envelope");
}

#[tokio::test]
async fn non_json_body_is_a_malformed_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = adapter(Provider::OpenAI, &server)
        .chat(&request(ChatModel::openai("gpt-4o")))
        .await
        .unwrap_err();
    let ctx = err.context().expect("context");
    assert_eq!(ctx.body_excerpt.as_deref(), Some("<html>gateway</html>"));
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

#[tokio::test]
async fn provider_gateway_retries_on_retryable_errors_and_succeeds() {
    let server = MockServer::start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));
    let second = ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": "ok" },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    }));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls,
            first,
            second,
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(Provider::OpenAI, &server),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let resp = gateway
        .chat(request(ChatModel::openai("gpt-4o")))
        .await
        .unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn provider_gateway_does_not_retry_client_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(Provider::OpenAI, &server),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let err = gateway
        .chat(request(ChatModel::openai("gpt-4o")))
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), Some(403));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn provider_gateway_rejects_model_from_another_provider() {
    let server = MockServer::start().await;
    let gateway = ProviderGateway::with_config(
        adapter(Provider::OpenAI, &server),
        Arc::new(NoopUsageSink),
        GatewayConfig::no_retries(),
    );

    let err = gateway
        .chat(request(ChatModel::openrouter("openai/gpt-4o")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}
