// Gemini provider
//
// Streams `streamGenerateContent` as SSE. Function calls get canonical ids
// derived from the request's turn id, so id-less calls line up with the
// responses the converter later sends back.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::base::{self, ProviderBase};
use super::sse::{DecodeStep, SseEvent, StreamDecoder};
use super::tool_format::ToolFormat;
use super::types::{CompletionRequest, ModelInfo};
use super::{DeltaStream, Provider};
use crate::auth::ResolvedToken;
use crate::config::BackendKind;
use crate::content::{ContentRecord, Usage};
use crate::converters::gemini::{GeminiContent, GeminiFunctionCall, GeminiPart};
use crate::converters::stream::ToolCallAccumulator;
use crate::converters::{ContentConverter, GeminiConverter};
use crate::errors::ProviderError;
use crate::runtime::RuntimeContext;
use crate::settings::ProviderSettings;

const API_VERSION: &str = "v1beta";

pub struct GeminiProvider {
    base: ProviderBase,
}

impl GeminiProvider {
    pub fn new(ctx: &RuntimeContext) -> Self {
        Self {
            base: ProviderBase::new(BackendKind::Gemini, ctx),
        }
    }

    fn authorize(builder: reqwest::RequestBuilder, token: &ResolvedToken) -> reqwest::RequestBuilder {
        if token.is_oauth() {
            builder.bearer_auth(&token.token)
        } else {
            builder.header("x-goog-api-key", &token.token)
        }
    }

    fn request_body(
        converter: &GeminiConverter,
        request: &CompletionRequest,
        settings: &ProviderSettings,
    ) -> Result<Value, ProviderError> {
        let contents = converter.from_history(&request.contents)?;
        let mut body = json!({ "contents": contents });

        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({ "parts": [GeminiPart::text(system)] });
        }

        let mut generation = Map::new();
        if let Some(max_tokens) = request.max_tokens.or(settings.max_tokens) {
            generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature.or(settings.temperature) {
            generation.insert("temperature".to_string(), json!(temperature));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        let tools = ToolFormat::Gemini.format_tools(&request.tools);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        Ok(body)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
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
            let url = format!("{}/{}/models", base.base_url(&settings), API_VERSION);
            let request = Self::authorize(base.client().get(&url), &token);

            let response = request.send().await.map_err(|e| base.transport(e))?;
            let list: ModelList = base::check_status(base.name(), response)
                .await?
                .json()
                .await
                .map_err(|e| base.transport(e))?;

            Ok(list
                .models
                .into_iter()
                .map(|model| ModelInfo {
                    id: model
                        .name
                        .strip_prefix("models/")
                        .unwrap_or(&model.name)
                        .to_string(),
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

        let converter = GeminiConverter::with_turn_key(base::turn_key(&request));

        let model = self.base.resolve_model(&request, &settings);
        let body = Self::request_body(&converter, &request, &settings)?;
        let url = format!(
            "{}/{}/models/{}:streamGenerateContent?alt=sse",
            self.base.base_url(&settings),
            API_VERSION,
            model
        );
        let policy = self.base.retry_policy(&settings);

        tracing::debug!(
            provider = self.base.name(),
            model = %model,
            oauth = token.is_oauth(),
            records = request.contents.len(),
            "starting generateContent stream"
        );

        let client = self.base.client();
        self.base
            .stream(
                &policy,
                cancel,
                || Self::authorize(client.post(&url), &token).json(&body),
                GenerateStreamDecoder::new(converter, &model),
            )
            .await
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

/// generateContent chunks to universal deltas
pub(crate) struct GenerateStreamDecoder {
    converter: GeminiConverter,
    model: String,
    tools: ToolCallAccumulator,
    next_call: usize,
    usage: Option<Usage>,
}

impl GenerateStreamDecoder {
    pub(crate) fn new(converter: GeminiConverter, model: &str) -> Self {
        let tools = ToolCallAccumulator::new(converter.turn_key(), BackendKind::Gemini.name());
        Self {
            converter,
            model: model.to_string(),
            tools,
            next_call: 0,
            usage: None,
        }
    }

    fn push_call(&mut self, call: GeminiFunctionCall) {
        let arguments = if call.args.is_null() {
            String::new()
        } else {
            call.args.to_string()
        };
        self.tools
            .push(self.next_call, call.id.as_deref(), Some(&call.name), &arguments);
        self.next_call += 1;
    }
}

impl StreamDecoder for GenerateStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<DecodeStep, ProviderError> {
        let provider = BackendKind::Gemini.name();
        let value = base::decode_payload(provider, &event.data)?;
        let chunk: GenerateChunk = base::typed_payload(provider, value)?;

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            });
        }

        let mut deltas = Vec::new();
        let parts = chunk
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts);

        for part in parts {
            if let Some(call) = part.function_call {
                self.push_call(call);
                continue;
            }

            let single = GeminiContent {
                role: "model".to_string(),
                parts: vec![part],
            };
            let record = self.converter.to_universal(&single)?;
            deltas.extend(
                record
                    .blocks
                    .into_iter()
                    .filter(|block| !block.is_blank())
                    .map(ContentRecord::delta),
            );
        }

        Ok(DecodeStep {
            deltas,
            done: false,
        })
    }

    fn finish(&mut self) -> Vec<ContentRecord> {
        let mut out: Vec<ContentRecord> = self.tools.finish().into_iter().collect();
        out.push(base::metadata_delta(&self.model, self.usage));
        out
    }
}
