// Test the turn driver against a scripted provider
//
// This test suite verifies that:
// 1. Streamed deltas reach the callback and merge into one history record
// 2. The provider sees history curated for its thinking policy
// 3. Cancellation keeps partial output and never errors
// 4. Stream failures leave history untouched
// 5. A call id reused by a later turn is recorded under a fresh id

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use switchboard::config::BackendKind;
use switchboard::content::{ContentBlock, ContentRecord, ThinkingSource, Usage};
use switchboard::errors::TurnError;
use switchboard::history::{HistoryService, ThinkingPolicy};
use switchboard::providers::{CompletionRequest, DeltaStream, ModelInfo, Provider};
use switchboard::{run_turn, ProviderError};

#[derive(Clone)]
enum Step {
    Delta(ContentRecord),
    Fail(String),
    WaitForCancel,
}

struct ScriptedProvider {
    script: Vec<Step>,
    policy: ThinkingPolicy,
    seen: Mutex<Option<CompletionRequest>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            policy: ThinkingPolicy::CurrentTurn,
            seen: Mutex::new(None),
        }
    }

    fn last_request(&self) -> Option<CompletionRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenAI
    }

    async fn default_model(&self) -> String {
        "scripted-1".to_string()
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(vec![ModelInfo::new("scripted-1")])
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ProviderError> {
        *self.seen.lock().unwrap() = Some(request);

        let (tx, rx) = mpsc::channel(16);
        let script = self.script.clone();
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Delta(delta) => {
                        if tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                    Step::Fail(message) => {
                        let _ = tx
                            .send(Err(ProviderError::Stream {
                                provider: "scripted".to_string(),
                                message,
                            }))
                            .await;
                        return;
                    }
                    Step::WaitForCancel => cancel.cancelled().await,
                }
            }
        });
        Ok(rx)
    }

    fn thinking_policy(&self) -> ThinkingPolicy {
        self.policy
    }
}

fn text(chunk: &str) -> Step {
    Step::Delta(ContentRecord::ai(vec![ContentBlock::text(chunk)]).unwrap())
}

fn usage(input_tokens: u32, output_tokens: u32) -> Step {
    let mut record = ContentRecord::ai(Vec::new()).unwrap();
    record.metadata.usage = Some(Usage {
        input_tokens,
        output_tokens,
    });
    Step::Delta(record)
}

fn history_with_prompt(prompt: &str) -> Result<HistoryService> {
    let history = HistoryService::new();
    history.append(ContentRecord::human(prompt))?;
    Ok(history)
}

#[tokio::test]
async fn test_turn_streams_and_records() -> Result<()> {
    let history = history_with_prompt("say hello")?;
    let provider = ScriptedProvider::new(vec![text("Hel"), text("lo"), usage(4, 2)]);

    let mut chunks = Vec::new();
    let outcome = run_turn(
        &history,
        &provider,
        CompletionRequest::default(),
        CancellationToken::new(),
        |delta| chunks.push(delta.text()),
    )
    .await?;

    assert_eq!(chunks, vec!["Hel", "lo", ""]);
    assert!(!outcome.cancelled);
    assert_eq!(outcome.index, Some(1));

    let record = outcome.record.expect("record");
    assert_eq!(record.text(), "Hello");
    assert_eq!(record.metadata.provider.as_deref(), Some("scripted"));
    assert_eq!(record.metadata.model.as_deref(), Some("scripted-1"));
    assert_eq!(record.metadata.usage, Some(Usage { input_tokens: 4, output_tokens: 2 }));
    assert!(record.metadata.turn_id.is_some());

    assert_eq!(history.len(), 2);
    assert_eq!(history.records()[1], record);
    Ok(())
}

#[tokio::test]
async fn test_request_is_curated_for_policy() -> Result<()> {
    let history = history_with_prompt("first")?;
    history.append(ContentRecord::ai(vec![
        ContentBlock::thinking("old reasoning", ThinkingSource::ReasoningContent),
        ContentBlock::text("first answer"),
    ])?)?;
    history.append(ContentRecord::human("second"))?;

    let provider = ScriptedProvider::new(vec![text("ok")]);
    run_turn(
        &history,
        &provider,
        CompletionRequest::default().with_model("scripted-2"),
        CancellationToken::new(),
        |_| {},
    )
    .await?;

    let request = provider.last_request().expect("request seen");
    assert_eq!(request.model.as_deref(), Some("scripted-2"));
    assert!(request.turn_id.is_some());
    assert_eq!(request.contents.len(), 3);
    assert!(request
        .contents
        .iter()
        .flat_map(|record| record.blocks.iter())
        .all(|block| !matches!(block, ContentBlock::Thinking { .. })));

    let stored = history.records();
    assert_eq!(stored[3].metadata.model.as_deref(), Some("scripted-2"));
    Ok(())
}

#[tokio::test]
async fn test_native_tool_ids_become_canonical() -> Result<()> {
    let history = history_with_prompt("list files")?;
    let call = ContentRecord::ai(vec![ContentBlock::tool_call(
        "call_1",
        "list_dir",
        json!({"dir": "."}),
    )])?;
    let provider = ScriptedProvider::new(vec![Step::Delta(call)]);

    let outcome = run_turn(
        &history,
        &provider,
        CompletionRequest::default(),
        CancellationToken::new(),
        |_| {},
    )
    .await?;

    let record = outcome.record.expect("record");
    let ContentBlock::ToolCall { id, .. } = &record.blocks[0] else {
        panic!("expected a tool call");
    };
    assert!(id.starts_with("hist_tool_"));
    assert_ne!(id, "hist_tool_1");
    assert_eq!(history.resolve_tool_id("call_1").as_deref(), Some(id.as_str()));
    assert_eq!(history.unanswered_tool_calls().len(), 1);
    Ok(())
}

async fn turn_calling(history: &HistoryService, id: &str) -> Result<String> {
    let call = ContentRecord::ai(vec![ContentBlock::tool_call(id, "list_dir", json!({"dir": "."}))])?;
    let provider = ScriptedProvider::new(vec![Step::Delta(call)]);
    let outcome = run_turn(
        history,
        &provider,
        CompletionRequest::default(),
        CancellationToken::new(),
        |_| {},
    )
    .await?;

    match outcome.record.as_ref().and_then(|record| record.tool_calls().next()) {
        Some(ContentBlock::ToolCall { id, .. }) => Ok(id.clone()),
        other => panic!("expected a tool call, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reused_call_id_across_turns() -> Result<()> {
    let history = history_with_prompt("list files")?;
    let first = turn_calling(&history, "hist_tool_0").await?;
    history.append(ContentRecord::tool(vec![ContentBlock::tool_response(
        "call_0",
        "",
        json!(["a.rs"]),
    )])?)?;

    history.append(ContentRecord::human("and again"))?;
    let second = turn_calling(&history, "hist_tool_0").await?;
    assert_eq!(first, "hist_tool_0");
    assert_ne!(second, first);

    history.append(ContentRecord::tool(vec![ContentBlock::tool_response(
        "call_0",
        "",
        json!(["a.rs", "b.rs"]),
    )])?)?;
    assert!(history.unanswered_tool_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancel_keeps_partial_output() -> Result<()> {
    let history = history_with_prompt("write an essay")?;
    let provider = ScriptedProvider::new(vec![
        text("Once upon"),
        Step::WaitForCancel,
        text(" a time"),
    ]);

    let cancel = CancellationToken::new();
    let on_first = cancel.clone();
    let outcome = run_turn(
        &history,
        &provider,
        CompletionRequest::default(),
        cancel,
        move |_| on_first.cancel(),
    )
    .await?;

    assert!(outcome.cancelled);
    let record = outcome.record.expect("partial record");
    assert!(record.text().starts_with("Once upon"));
    assert_eq!(history.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_output_records_nothing() -> Result<()> {
    let history = history_with_prompt("anything")?;
    let provider = ScriptedProvider::new(vec![Step::WaitForCancel]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let outcome = run_turn(&history, &provider, CompletionRequest::default(), cancel, |_| {}).await?;

    assert!(outcome.cancelled);
    assert_eq!(outcome.index, None);
    assert!(outcome.record.is_none());
    assert_eq!(history.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stream_error_leaves_history_alone() -> Result<()> {
    let history = history_with_prompt("fail please")?;
    let provider = ScriptedProvider::new(vec![text("partial"), Step::Fail("overloaded".to_string())]);

    let err = run_turn(
        &history,
        &provider,
        CompletionRequest::default(),
        CancellationToken::new(),
        |_| {},
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TurnError::Provider(ProviderError::Stream { .. })));
    assert_eq!(history.len(), 1);
    Ok(())
}
