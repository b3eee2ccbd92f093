// OpenAI-compatible provider
//
// Serves the `openai`, `qwen` and `local` backends, which all speak the
// chat-completions API. Qwen text is buffered to natural breaks, and Qwen and
// local models may inline reasoning as <think> tags.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::base::{self, ProviderBase};
use super::sse::{DecodeStep, SseEvent, StreamDecoder};
use super::tool_format::ToolFormat;
use super::types::{CompletionRequest, ModelInfo};
use super::{DeltaStream, Provider};
use crate::config::BackendKind;
use crate::content::{ContentBlock, ContentRecord, ThinkingSource, Usage};
use crate::converters::stream::{Segment, TextBuffer, ThinkTagSplitter, ToolCallAccumulator};
use crate::converters::{ContentConverter, OpenAIConverter};
use crate::converters::openai::OpenAIMessage;
use crate::errors::ProviderError;
use crate::history::ThinkingPolicy;
use crate::runtime::RuntimeContext;
use crate::settings::ProviderSettings;

/// Chat-completions provider
pub struct OpenAIProvider {
    base: ProviderBase,
    converter: OpenAIConverter,
}

impl OpenAIProvider {
    pub fn new(kind: BackendKind, ctx: &RuntimeContext) -> Self {
        Self {
            base: ProviderBase::new(kind, ctx),
            converter: OpenAIConverter::for_backend(kind),
        }
    }

    /// Tool format for this wire; only the OpenAI-shaped formats apply
    fn tool_format(&self, model: &str, settings: &ProviderSettings) -> ToolFormat {
        let fallback = match self.base.kind() {
            BackendKind::Qwen => ToolFormat::Qwen,
            _ => ToolFormat::OpenAI,
        };
        match ToolFormat::detect(model, settings.tool_format.as_deref(), fallback) {
            ToolFormat::Qwen => ToolFormat::Qwen,
            ToolFormat::OpenAI => ToolFormat::OpenAI,
            other => {
                tracing::debug!(
                    provider = self.base.name(),
                    "tool format {} does not fit chat completions, using {}",
                    other.as_str(),
                    fallback.as_str()
                );
                fallback
            }
        }
    }

    fn request_body(
        &self,
        request: &CompletionRequest,
        settings: &ProviderSettings,
        model: &str,
    ) -> Result<Value, ProviderError> {
        let mut messages = Vec::with_capacity(request.contents.len() + 1);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(OpenAIMessage::text("system", system));
        }
        messages.extend(self.converter.from_history(&request.contents)?);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });

        // Only the first-party API reports usage on streams
        if self.base.kind() == BackendKind::OpenAI {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens.or(settings.max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature.or(settings.temperature) {
            body["temperature"] = json!(temperature);
        }

        let tools = self.tool_format(model, settings).format_tools(&request.tools);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        Ok(body)
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> BackendKind {
        self.base.kind()
    }

    async fn default_model(&self) -> String {
        self.base.default_model(&self.base.settings().await)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let base = &self.base;
        base.list_models_with(|token, settings| async move {
            let url = format!("{}/models", base.base_url(&settings));
            let mut request = base.client().get(&url);
            if let Some(token) = &token {
                request = request.bearer_auth(&token.token);
            }

            let response = request.send().await.map_err(|e| base.transport(e))?;
            let list: ModelList = base::check_status(base.name(), response)
                .await?
                .json()
                .await
                .map_err(|e| base.transport(e))?;

            Ok(list.data.into_iter().map(|model| ModelInfo::new(model.id)).collect())
        })
        .await
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ProviderError> {
        let settings = self.base.settings().await;
        let token = if self.base.kind().requires_endpoint() {
            self.base.optional_token().await?
        } else {
            Some(self.base.require_token().await?)
        };

        let model = self.base.resolve_model(&request, &settings);
        let body = self.request_body(&request, &settings, &model)?;
        let url = format!("{}/chat/completions", self.base.base_url(&settings));
        let policy = self.base.retry_policy(&settings);

        tracing::debug!(
            provider = self.base.name(),
            model = %model,
            records = request.contents.len(),
            tools = request.tools.len(),
            "starting chat completion"
        );

        let client = self.base.client();
        let decoder = ChatStreamDecoder::new(self.base.kind(), &model, &base::turn_key(&request));
        self.base
            .stream(
                &policy,
                cancel,
                || {
                    let mut builder = client.post(&url).json(&body);
                    if let Some(token) = &token {
                        builder = builder.bearer_auth(&token.token);
                    }
                    builder
                },
                decoder,
            )
            .await
    }

    fn thinking_policy(&self) -> ThinkingPolicy {
        match self.base.kind() {
            // The first-party API does not accept reasoning back
            BackendKind::OpenAI => ThinkingPolicy::None,
            _ => ThinkingPolicy::CurrentTurn,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Chat-completions chunks to universal deltas
pub(crate) struct ChatStreamDecoder {
    provider: &'static str,
    model: String,
    tools: ToolCallAccumulator,
    think: Option<ThinkTagSplitter>,
    text: Option<TextBuffer>,
    usage: Option<Usage>,
}

impl ChatStreamDecoder {
    pub(crate) fn new(kind: BackendKind, model: &str, turn_key: &str) -> Self {
        Self {
            provider: kind.name(),
            model: model.to_string(),
            tools: ToolCallAccumulator::new(turn_key, kind.name()),
            think: kind.parses_think_tags().then(ThinkTagSplitter::new),
            text: kind.buffers_text().then(TextBuffer::new),
            usage: None,
        }
    }

    fn flush_text(&mut self, out: &mut Vec<ContentRecord>) {
        if let Some(held) = self.text.as_mut().and_then(TextBuffer::flush) {
            out.push(ContentRecord::delta(ContentBlock::text(held)));
        }
    }

    fn emit_thinking(&mut self, thought: String, source: ThinkingSource, out: &mut Vec<ContentRecord>) {
        if thought.is_empty() {
            return;
        }
        self.flush_text(out);
        out.push(ContentRecord::delta(ContentBlock::thinking(thought, source)));
    }

    fn emit_text(&mut self, text: String, out: &mut Vec<ContentRecord>) {
        let ready = match self.text.as_mut() {
            Some(buffer) => buffer.push(&text),
            None => Some(text),
        };
        if let Some(text) = ready.filter(|t| !t.is_empty()) {
            out.push(ContentRecord::delta(ContentBlock::text(text)));
        }
    }

    fn emit_segments(&mut self, segments: Vec<Segment>, out: &mut Vec<ContentRecord>) {
        for segment in segments {
            match segment {
                Segment::Text(text) => self.emit_text(text, out),
                Segment::Thinking(thought) => {
                    self.emit_thinking(thought, ThinkingSource::ThinkTags, out)
                }
            }
        }
    }
}

impl StreamDecoder for ChatStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<DecodeStep, ProviderError> {
        if event.is_done() {
            return Ok(DecodeStep::done());
        }

        let value = base::decode_payload(self.provider, &event.data)?;
        let chunk: ChatChunk = base::typed_payload(self.provider, value)?;

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        let mut deltas = Vec::new();
        for delta in chunk.choices.into_iter().filter_map(|choice| choice.delta) {
            if let Some(reasoning) = delta.reasoning_content {
                self.emit_thinking(reasoning, ThinkingSource::ReasoningContent, &mut deltas);
            }

            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                let segments = match self.think.as_mut() {
                    Some(splitter) => splitter.push(&content),
                    None => vec![Segment::Text(content)],
                };
                self.emit_segments(segments, &mut deltas);
            }

            for call in delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(function) => (function.name, function.arguments),
                    None => (None, None),
                };
                self.tools.push(
                    call.index,
                    call.id.as_deref(),
                    name.as_deref(),
                    arguments.as_deref().unwrap_or_default(),
                );
            }
        }

        Ok(DecodeStep {
            deltas,
            done: false,
        })
    }

    fn finish(&mut self) -> Vec<ContentRecord> {
        let mut out = Vec::new();

        if let Some(segments) = self.think.as_mut().map(ThinkTagSplitter::finish) {
            self.emit_segments(segments, &mut out);
        }
        self.flush_text(&mut out);

        if let Some(calls) = self.tools.finish() {
            tracing::debug!(provider = self.provider, count = calls.blocks.len(), "tool calls completed");
            out.push(calls);
        }

        out.push(base::metadata_delta(&self.model, self.usage));
        out
    }
}
