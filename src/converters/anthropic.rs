// Anthropic messages converter

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_tool_output, render_code, render_tool_output, ContentConverter};
use crate::content::{
    ids, ContentBlock, ContentRecord, MediaEncoding, Speaker, ThinkingSource,
};
use crate::errors::ConversionError;

const BACKEND: &str = "anthropic";
const NATIVE_PREFIX: &str = "toolu_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

impl AnthropicContent {
    pub fn into_blocks(self) -> Vec<AnthropicBlock> {
        match self {
            AnthropicContent::Text(text) => vec![AnthropicBlock::Text { text }],
            AnthropicContent::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// String or array of text blocks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        source: AnthropicImageSource,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// Converter for the Anthropic messages API
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicConverter;

impl AnthropicConverter {
    pub fn new() -> Self {
        Self
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn universal_block(block: &AnthropicBlock) -> ContentBlock {
    match block {
        AnthropicBlock::Text { text } => ContentBlock::text(text.clone()),
        AnthropicBlock::Thinking {
            thinking,
            signature,
        } => ContentBlock::Thinking {
            thought: thinking.clone(),
            source_field: ThinkingSource::Thinking,
            signature: signature.clone(),
            is_hidden: false,
        },
        // Redacted reasoning is opaque; keep the payload so it can be replayed
        AnthropicBlock::RedactedThinking { data } => ContentBlock::Thinking {
            thought: String::new(),
            source_field: ThinkingSource::Thinking,
            signature: Some(data.clone()),
            is_hidden: true,
        },
        AnthropicBlock::ToolUse { id, name, input } => ContentBlock::ToolCall {
            id: ids::canonicalize(id),
            name: name.clone(),
            parameters: input.clone(),
            description: None,
        },
        AnthropicBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let text = tool_result_text(content.as_ref());
            if is_error.unwrap_or(false) {
                ContentBlock::ToolResponse {
                    call_id: ids::canonicalize(tool_use_id),
                    tool_name: String::new(),
                    result: Value::Null,
                    error: Some(text),
                }
            } else {
                ContentBlock::tool_response(
                    ids::canonicalize(tool_use_id),
                    String::new(),
                    parse_tool_output(&text),
                )
            }
        }
        AnthropicBlock::Image { source } => match source {
            AnthropicImageSource::Base64 { media_type, data } => ContentBlock::Media {
                mime_type: media_type.clone(),
                data: data.clone(),
                encoding: MediaEncoding::Base64,
            },
            AnthropicImageSource::Url { url } => ContentBlock::Media {
                mime_type: "image/*".to_string(),
                data: url.clone(),
                encoding: MediaEncoding::Url,
            },
        },
    }
}

impl ContentConverter for AnthropicConverter {
    type Wire = AnthropicMessage;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn to_universal(&self, message: &AnthropicMessage) -> Result<ContentRecord, ConversionError> {
        let blocks: Vec<ContentBlock> = message
            .content
            .clone()
            .into_blocks()
            .iter()
            .map(universal_block)
            .collect();

        let speaker = match message.role.as_str() {
            "user" if blocks.iter().any(ContentBlock::is_tool_response) => Speaker::Tool,
            "user" => Speaker::Human,
            "assistant" => Speaker::Ai,
            other => {
                return Err(ConversionError::UnsupportedRole {
                    backend: BACKEND,
                    role: other.to_string(),
                })
            }
        };

        if speaker == Speaker::Human && blocks.is_empty() {
            return Err(ConversionError::EmptyMessage { backend: BACKEND });
        }

        Ok(ContentRecord::new(speaker, blocks)?.with_provider(BACKEND))
    }

    fn from_universal(&self, record: &ContentRecord) -> Result<Vec<AnthropicMessage>, ConversionError> {
        let mut blocks = Vec::new();

        for block in &record.blocks {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        blocks.push(AnthropicBlock::Text { text: text.clone() });
                    }
                }
                ContentBlock::Thinking {
                    thought,
                    source_field,
                    signature,
                    is_hidden,
                } => {
                    // Only our own signed reasoning can be replayed; anything
                    // else would be rejected by the API
                    if *source_field != ThinkingSource::Thinking {
                        continue;
                    }
                    match (signature, is_hidden) {
                        (Some(data), true) => {
                            blocks.push(AnthropicBlock::RedactedThinking { data: data.clone() })
                        }
                        (Some(signature), false) => blocks.push(AnthropicBlock::Thinking {
                            thinking: thought.clone(),
                            signature: Some(signature.clone()),
                        }),
                        (None, _) => {}
                    }
                }
                ContentBlock::ToolCall {
                    id,
                    name,
                    parameters,
                    ..
                } => blocks.push(AnthropicBlock::ToolUse {
                    id: ids::to_native(id, NATIVE_PREFIX),
                    name: name.clone(),
                    input: if parameters.is_object() {
                        parameters.clone()
                    } else {
                        serde_json::json!({ "value": parameters })
                    },
                }),
                ContentBlock::ToolResponse {
                    call_id,
                    result,
                    error,
                    ..
                } => blocks.push(AnthropicBlock::ToolResult {
                    tool_use_id: ids::to_native(call_id, NATIVE_PREFIX),
                    content: Some(Value::String(render_tool_output(result, error.as_deref()))),
                    is_error: error.as_ref().map(|_| true),
                }),
                ContentBlock::Media {
                    mime_type,
                    data,
                    encoding,
                } => blocks.push(AnthropicBlock::Image {
                    source: match encoding {
                        MediaEncoding::Base64 => AnthropicImageSource::Base64 {
                            media_type: mime_type.clone(),
                            data: data.clone(),
                        },
                        MediaEncoding::Url => AnthropicImageSource::Url { url: data.clone() },
                    },
                }),
                ContentBlock::Code {
                    code,
                    language,
                    execution_result,
                    ..
                } => blocks.push(AnthropicBlock::Text {
                    text: render_code(code, language.as_deref(), execution_result.as_deref()),
                }),
            }
        }

        if blocks.is_empty() {
            return Ok(Vec::new());
        }

        let role = match record.speaker {
            Speaker::Ai => "assistant",
            Speaker::Human | Speaker::Tool => "user",
        };
        Ok(vec![AnthropicMessage {
            role: role.to_string(),
            content: AnthropicContent::Blocks(blocks),
        }])
    }
}
