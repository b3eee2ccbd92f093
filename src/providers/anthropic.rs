// Anthropic messages provider
//
// Streams the messages API. Signed thinking from earlier responses is replayed
// as-is, so this backend is sent every thinking block in history.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::base::{self, ProviderBase};
use super::sse::{DecodeStep, SseEvent, StreamDecoder};
use super::tool_format::ToolFormat;
use super::types::{CompletionRequest, ModelInfo};
use super::{DeltaStream, Provider};
use crate::auth::ResolvedToken;
use crate::config::BackendKind;
use crate::content::{ContentBlock, ContentRecord, ThinkingSource, Usage};
use crate::converters::anthropic::{AnthropicContent, AnthropicMessage};
use crate::converters::stream::ToolCallAccumulator;
use crate::converters::{AnthropicConverter, ContentConverter};
use crate::errors::ProviderError;
use crate::history::ThinkingPolicy;
use crate::runtime::RuntimeContext;
use crate::settings::ProviderSettings;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    base: ProviderBase,
    converter: AnthropicConverter,
}

impl AnthropicProvider {
    pub fn new(ctx: &RuntimeContext) -> Self {
        Self {
            base: ProviderBase::new(BackendKind::Anthropic, ctx),
            converter: AnthropicConverter::new(),
        }
    }

    fn authorize(builder: reqwest::RequestBuilder, token: &ResolvedToken) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        if token.is_oauth() {
            builder
                .bearer_auth(&token.token)
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", &token.token)
        }
    }

    fn request_body(
        &self,
        request: &CompletionRequest,
        settings: &ProviderSettings,
        model: &str,
    ) -> Result<Value, ProviderError> {
        let messages = merge_roles(self.converter.from_history(&request.contents)?);

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.or(settings.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
            "stream": true,
        });

        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature.or(settings.temperature) {
            body["temperature"] = json!(temperature);
        }

        let tools = ToolFormat::Anthropic.format_tools(&request.tools);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        Ok(body)
    }
}

/// The API requires alternating roles; tool results and the next user
/// message both map to `user`
fn merge_roles(messages: Vec<AnthropicMessage>) -> Vec<AnthropicMessage> {
    let mut merged: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => {
                let previous = std::mem::replace(&mut last.content, AnthropicContent::Blocks(Vec::new()));
                let mut blocks = previous.into_blocks();
                blocks.extend(message.content.into_blocks());
                last.content = AnthropicContent::Blocks(blocks);
            }
            _ => merged.push(message),
        }
    }
    merged
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Anthropic
    }

    async fn default_model(&self) -> String {
        self.base.default_model(&self.base.settings().await)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let base = &self.base;
        base.list_models_with(|token, settings| async move {
            let Some(token) = token else {
                return Ok(Vec::new());
            };
            let url = format!("{}/v1/models", base.base_url(&settings));
            let request = Self::authorize(base.client().get(&url), &token);

            let response = request.send().await.map_err(|e| base.transport(e))?;
            let list: ModelList = base::check_status(base.name(), response)
                .await?
                .json()
                .await
                .map_err(|e| base.transport(e))?;

            Ok(list
                .data
                .into_iter()
                .map(|model| ModelInfo {
                    id: model.id,
                    display_name: model.display_name,
                })
                .collect())
        })
        .await
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ProviderError> {
        let settings = self.base.settings().await;
        let token = self.base.require_token().await?;

        let model = self.base.resolve_model(&request, &settings);
        let body = self.request_body(&request, &settings, &model)?;
        let url = format!("{}/v1/messages", self.base.base_url(&settings));
        let policy = self.base.retry_policy(&settings);

        tracing::debug!(
            provider = self.base.name(),
            model = %model,
            oauth = token.is_oauth(),
            records = request.contents.len(),
            "starting messages stream"
        );

        let client = self.base.client();
        self.base
            .stream(
                &policy,
                cancel,
                || Self::authorize(client.post(&url), &token).json(&body),
                MessagesStreamDecoder::new(&model, &base::turn_key(&request)),
            )
            .await
    }

    fn thinking_policy(&self) -> ThinkingPolicy {
        ThinkingPolicy::All
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
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<StreamUsage>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

/// Messages API events to universal deltas
pub(crate) struct MessagesStreamDecoder {
    model: String,
    tools: ToolCallAccumulator,
    usage: Usage,
    saw_usage: bool,
}

impl MessagesStreamDecoder {
    pub(crate) fn new(model: &str, turn_key: &str) -> Self {
        Self {
            model: model.to_string(),
            tools: ToolCallAccumulator::new(turn_key, BackendKind::Anthropic.name()),
            usage: Usage::default(),
            saw_usage: false,
        }
    }

    fn record_usage(&mut self, usage: StreamUsage) {
        if let Some(input) = usage.input_tokens {
            self.usage.input_tokens = input;
            self.saw_usage = true;
        }
        if let Some(output) = usage.output_tokens {
            self.usage.output_tokens = output;
            self.saw_usage = true;
        }
    }
}

fn thinking_delta(thought: String, signature: Option<String>) -> ContentRecord {
    ContentRecord::delta(ContentBlock::Thinking {
        thought,
        source_field: ThinkingSource::Thinking,
        signature,
        is_hidden: false,
    })
}

impl StreamDecoder for MessagesStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<DecodeStep, ProviderError> {
        let provider = BackendKind::Anthropic.name();
        let value = base::decode_payload(provider, &event.data)?;
        let event: StreamEvent = base::typed_payload(provider, value)?;

        let step = match event {
            StreamEvent::MessageStart { message } => {
                if let Some(model) = message.model {
                    self.model = model;
                }
                if let Some(usage) = message.usage {
                    self.record_usage(usage);
                }
                DecodeStep::default()
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StartBlock::Text { text } if !text.is_empty() => {
                    DecodeStep::delta(ContentRecord::delta(ContentBlock::text(text)))
                }
                StartBlock::Thinking { thinking } if !thinking.is_empty() => {
                    DecodeStep::delta(thinking_delta(thinking, None))
                }
                StartBlock::RedactedThinking { data } => {
                    DecodeStep::delta(ContentRecord::delta(ContentBlock::Thinking {
                        thought: String::new(),
                        source_field: ThinkingSource::Thinking,
                        signature: Some(data),
                        is_hidden: true,
                    }))
                }
                StartBlock::ToolUse { id, name } => {
                    self.tools.push(index, Some(&id), Some(&name), "");
                    DecodeStep::default()
                }
                _ => DecodeStep::default(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    DecodeStep::delta(ContentRecord::delta(ContentBlock::text(text)))
                }
                BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    DecodeStep::delta(thinking_delta(thinking, None))
                }
                BlockDelta::SignatureDelta { signature } => {
                    DecodeStep::delta(thinking_delta(String::new(), Some(signature)))
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    self.tools.push(index, None, None, &partial_json);
                    DecodeStep::default()
                }
                _ => DecodeStep::default(),
            },
            StreamEvent::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    self.record_usage(usage);
                }
                DecodeStep::default()
            }
            StreamEvent::MessageStop => DecodeStep::done(),
            StreamEvent::Other => DecodeStep::default(),
        };

        Ok(step)
    }

    fn finish(&mut self) -> Vec<ContentRecord> {
        let mut out: Vec<ContentRecord> = self.tools.finish().into_iter().collect();
        let usage = self.saw_usage.then_some(self.usage);
        out.push(base::metadata_delta(&self.model, usage));
        out
    }
}
