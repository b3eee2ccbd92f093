// Test provider adapters against mock HTTP backends
//
// This test suite verifies that:
// 1. Streams from each wire family fold into the expected record
// 2. 429/5xx responses are retried, other failures are not
// 3. Missing credentials fail before any request is sent
// 4. Cancellation ends a turn quietly, even mid-retry or mid-stream
// 5. Model listing falls back without credentials

use anyhow::Result;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use switchboard::auth::AuthPrecedenceResolver;
use switchboard::config::{BackendKind, Config};
use switchboard::content::{ids, ContentBlock, ThinkingSource};
use switchboard::providers::{create_provider, CompletionRequest, ToolDefinition};
use switchboard::settings::{MemorySettingsRepository, PersistPolicy, SettingsStore};
use switchboard::{ContentRecord, ProviderError, RuntimeContext};

/// Context whose only credential source is the settings themselves
async fn context_with(provider: &str, settings: Value) -> Result<RuntimeContext> {
    let store = Arc::new(SettingsStore::with_state(
        Arc::new(MemorySettingsRepository::new()),
        PersistPolicy::default(),
        Default::default(),
    ));
    store.update_settings(provider, settings).await?;

    let auth = Arc::new(
        AuthPrecedenceResolver::new(Arc::clone(&store), Duration::from_secs(60))
            .with_env_lookup(Arc::new(|_: &str| -> Option<String> { None })),
    );
    RuntimeContext::from_parts(Config::default(), store, auth)
}

fn prompt(text: &str) -> CompletionRequest {
    CompletionRequest::new(vec![ContentRecord::human(text)])
}

fn sse(events: &[Value]) -> String {
    events
        .iter()
        .map(|event| format!("data: {}\n\n", event))
        .collect()
}

fn named_sse(events: &[Value]) -> String {
    events
        .iter()
        .map(|event| format!("event: {}\ndata: {}\n\n", event["type"].as_str().unwrap_or(""), event))
        .collect()
}

#[tokio::test]
async fn test_openai_two_429s_then_success() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let throttled = server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_body(r#"{"error":{"message":"rate limited"}}"#)
        .expect(2)
        .create_async()
        .await;
    let body = sse(&[
        json!({"choices": [{"delta": {"content": "Hello"}}]}),
        json!({"choices": [{"delta": {"content": " world"}}]}),
    ]) + "data: [DONE]\n\n";
    let ok = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let ctx = context_with(
        "openai",
        json!({"enabled": true, "apiKey": "sk-test", "baseUrl": server.url(), "retries": 3, "retryWaitMs": 1}),
    )
    .await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let record = provider.complete(prompt("hi"), CancellationToken::new()).await?;
    assert_eq!(record.text(), "Hello world");
    assert_eq!(record.metadata.provider.as_deref(), Some("openai"));

    throttled.assert_async().await;
    ok.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_openai_retry_exhaustion() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let unavailable = server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body("upstream down")
        .expect(2)
        .create_async()
        .await;

    let ctx = context_with(
        "openai",
        json!({"apiKey": "sk-test", "baseUrl": server.url(), "retries": 2, "retryWaitMs": 1}),
    )
    .await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let err = provider
        .stream_completion(prompt("hi"), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ProviderError::RetryExhausted {
            attempts, status, ..
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(status, 503);
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }

    unavailable.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_unauthorized_status_is_not_retried() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let rejected = server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error":{"message":"invalid api key"}}"#)
        .expect(1)
        .create_async()
        .await;

    let ctx = context_with(
        "openai",
        json!({"apiKey": "sk-revoked", "baseUrl": server.url(), "retries": 5, "retryWaitMs": 1}),
    )
    .await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let err = provider
        .stream_completion(prompt("hi"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Http { status: 401, .. }));
    assert!(err.is_auth_error());

    rejected.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_credentials_fail_before_request() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let never = server
        .mock("POST", "/chat/completions")
        .expect(0)
        .create_async()
        .await;

    let ctx = context_with("openai", json!({"baseUrl": server.url()})).await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let err = provider
        .stream_completion(prompt("hi"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unauthorized { .. }));
    assert!(err.is_auth_error());
    assert!(err.user_hint().is_some());

    never.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_retry_wait_ends_stream_quietly() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let throttled = server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .expect(1)
        .create_async()
        .await;

    let ctx = context_with(
        "openai",
        json!({"apiKey": "sk-test", "baseUrl": server.url(), "retries": 3, "retryWaitMs": 20000}),
    )
    .await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let mut stream = provider.stream_completion(prompt("hi"), cancel).await?;
    assert!(stream.recv().await.is_none());
    assert!(started.elapsed() < Duration::from_secs(10));

    throttled.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_mid_stream_drops_pending_tool_calls() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let head = sse(&[json!({"choices": [{"delta": {"content": "Let me look."}}]})]);
    let tail = sse(&[
        json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "read_file", "arguments": "{}"}}]}}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 4}}),
    ]) + "data: [DONE]\n\n";
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_chunked_body(move |writer| {
            writer.write_all(head.as_bytes())?;
            std::thread::sleep(Duration::from_millis(500));
            writer.write_all(tail.as_bytes())
        })
        .create_async()
        .await;

    let ctx = context_with("openai", json!({"apiKey": "sk-test", "baseUrl": server.url()})).await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let cancel = CancellationToken::new();
    let mut stream = provider.stream_completion(prompt("read it"), cancel.clone()).await?;

    let first = stream.recv().await.expect("first delta")?;
    assert_eq!(first.text(), "Let me look.");
    cancel.cancel();

    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        let mut rest = Vec::new();
        while let Some(delta) = stream.recv().await {
            rest.push(delta);
        }
        rest
    })
    .await?;

    for delta in rest {
        let delta = delta?;
        assert_eq!(delta.tool_calls().count(), 0);
        assert!(delta.metadata.model.is_none());
        assert!(delta.metadata.usage.is_none());
    }

    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_openai_tool_definitions_and_streamed_call() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let body = sse(&[
        json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_9", "function": {"name": "read_file", "arguments": ""}}]}}]}),
        json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"path\":\"Cargo.toml\"}"}}]}}]}),
    ]) + "data: [DONE]\n\n";
    let mock = server
        .mock("POST", "/chat/completions")
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::PartialJson(json!({"stream": true})),
            mockito::Matcher::Regex(r#""name":"read_file""#.to_string()),
        ]))
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let ctx = context_with("openai", json!({"apiKey": "sk-test", "baseUrl": server.url()})).await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let request = prompt("show me the manifest")
        .with_turn_id("turn-9")
        .with_tools(vec![ToolDefinition::new(
            "read_file",
            "Read a file",
            json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        )]);
    let record = provider.complete(request, CancellationToken::new()).await?;

    let calls: Vec<&ContentBlock> = record.tool_calls().collect();
    assert_eq!(calls.len(), 1);
    match calls[0] {
        ContentBlock::ToolCall { id, parameters, .. } => {
            let expected = ids::generate_canonical_id("turn-9", 0, "openai", Some("call_9"), "read_file");
            assert_eq!(id, &expected);
            assert_eq!(parameters, &json!({"path": "Cargo.toml"}));
            assert_eq!(record.metadata.native_tool_ids.get("call_9"), Some(&expected));
        }
        other => panic!("unexpected block {:?}", other),
    }

    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_anthropic_stream_with_signed_thinking() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let body = named_sse(&[
        json!({"type": "message_start", "message": {"model": "claude-sonnet-4-20250514", "usage": {"input_tokens": 11}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "Short answer."}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "EqQB"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": "Four."}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 6}}),
        json!({"type": "message_stop"}),
    ]);
    let mock = server
        .mock("POST", "/v1/messages")
        .match_header("x-api-key", "sk-ant")
        .match_header("anthropic-version", "2023-06-01")
        .match_body(mockito::Matcher::PartialJson(json!({"system": "Be brief.", "max_tokens": 4096})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let ctx = context_with("anthropic", json!({"apiKey": "sk-ant", "baseUrl": server.url()})).await?;
    let provider = create_provider(BackendKind::Anthropic, &ctx);

    let record = provider
        .complete(
            prompt("2+2?").with_system_prompt("Be brief."),
            CancellationToken::new(),
        )
        .await?;

    assert_eq!(record.text(), "Four.");
    assert!(matches!(
        &record.blocks[0],
        ContentBlock::Thinking { source_field: ThinkingSource::Thinking, signature: Some(sig), .. } if sig == "EqQB"
    ));
    let usage = record.metadata.usage.expect("usage reported");
    assert_eq!((usage.input_tokens, usage.output_tokens), (11, 6));

    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_gemini_stream_and_api_key_header() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let body = sse(&[
        json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hi "}]}}]}),
        json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "there"}]}}],
               "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}}),
    ]);
    let mock = server
        .mock(
            "POST",
            "/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse",
        )
        .match_header("x-goog-api-key", "g-key")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let ctx = context_with(
        "gemini",
        json!({"apiKey": "g-key", "baseUrl": server.url(), "model": "gemini-2.5-flash"}),
    )
    .await?;
    let provider = create_provider(BackendKind::Gemini, &ctx);

    let record = provider.complete(prompt("hello"), CancellationToken::new()).await?;
    assert_eq!(record.text(), "Hi there");

    mock.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_list_models_without_credentials_uses_fallback() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let never = server.mock("GET", "/models").expect(0).create_async().await;

    let ctx = context_with("openai", json!({"baseUrl": server.url()})).await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let models = provider.list_models().await?;
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, BackendKind::OpenAI.fallback_models());

    never.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn test_list_models_from_backend() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/models")
        .match_header("authorization", "Bearer sk-test")
        .with_status(200)
        .with_body(r#"{"data":[{"id":"gpt-4o"},{"id":"o3"}]}"#)
        .create_async()
        .await;

    let ctx = context_with("openai", json!({"apiKey": "sk-test", "baseUrl": server.url()})).await?;
    let provider = create_provider(BackendKind::OpenAI, &ctx);

    let models = provider.list_models().await?;
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["gpt-4o", "o3"]);

    mock.assert_async().await;
    Ok(())
}
