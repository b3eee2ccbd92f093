// OpenAI chat-completions converter
//
// Also used for the OpenAI-compatible backends (Qwen, local servers). Those
// may carry reasoning in `reasoning_content` or inline `<think>` tags.

use serde::{Deserialize, Serialize};

use super::stream::{normalize_arguments, split_think_tags, Segment};
use super::{parse_tool_output, render_code, render_tool_output, ContentConverter};
use crate::config::BackendKind;
use crate::content::{
    ids, ContentBlock, ContentRecord, MediaEncoding, Speaker, ThinkingSource,
};
use crate::errors::ConversionError;

const NATIVE_PREFIX: &str = "call_";

/// Chat-completions message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<OpenAIContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OpenAIToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl OpenAIMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(OpenAIContent::Text(content.into())),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAIContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAIImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: OpenAIFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIFunctionCall {
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

/// Converter for the OpenAI wire family
#[derive(Debug, Clone, Copy)]
pub struct OpenAIConverter {
    backend: BackendKind,
}

impl Default for OpenAIConverter {
    fn default() -> Self {
        Self::for_backend(BackendKind::OpenAI)
    }
}

impl OpenAIConverter {
    pub fn for_backend(backend: BackendKind) -> Self {
        Self { backend }
    }

    fn user_blocks(content: Option<&OpenAIContent>) -> Vec<ContentBlock> {
        match content {
            None => Vec::new(),
            Some(OpenAIContent::Text(text)) => vec![ContentBlock::text(text.clone())],
            Some(OpenAIContent::Parts(parts)) => parts
                .iter()
                .map(|part| match part {
                    OpenAIContentPart::Text { text } => ContentBlock::text(text.clone()),
                    OpenAIContentPart::ImageUrl { image_url } => media_from_url(&image_url.url),
                })
                .collect(),
        }
    }

    fn assistant_blocks(&self, message: &OpenAIMessage) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();

        if let Some(reasoning) = message.reasoning_content.as_deref() {
            if !reasoning.is_empty() {
                blocks.push(ContentBlock::thinking(reasoning, ThinkingSource::ReasoningContent));
            }
        }

        for block in Self::user_blocks(message.content.as_ref()) {
            match block {
                ContentBlock::Text { text } if self.backend.parses_think_tags() => {
                    blocks.extend(split_think_tags(&text).into_iter().map(|segment| match segment {
                        Segment::Text(text) => ContentBlock::text(text),
                        Segment::Thinking(thought) => {
                            ContentBlock::thinking(thought, ThinkingSource::ThinkTags)
                        }
                    }))
                }
                other => blocks.push(other),
            }
        }

        for call in &message.tool_calls {
            blocks.push(ContentBlock::ToolCall {
                id: ids::canonicalize(&call.id),
                name: call.function.name.clone(),
                parameters: normalize_arguments(&call.function.arguments),
                description: None,
            });
        }

        blocks
    }
}

fn media_from_url(url: &str) -> ContentBlock {
    // data:<mime>;base64,<payload>
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((header, data)) = rest.split_once(',') {
            if let Some(mime) = header.strip_suffix(";base64") {
                return ContentBlock::Media {
                    mime_type: mime.to_string(),
                    data: data.to_string(),
                    encoding: MediaEncoding::Base64,
                };
            }
        }
    }
    ContentBlock::Media {
        mime_type: "image/*".to_string(),
        data: url.to_string(),
        encoding: MediaEncoding::Url,
    }
}

fn media_to_part(mime_type: &str, data: &str, encoding: MediaEncoding) -> OpenAIContentPart {
    let url = match encoding {
        MediaEncoding::Base64 => format!("data:{};base64,{}", mime_type, data),
        MediaEncoding::Url => data.to_string(),
    };
    OpenAIContentPart::ImageUrl {
        image_url: OpenAIImageUrl { url },
    }
}

impl ContentConverter for OpenAIConverter {
    type Wire = OpenAIMessage;

    fn backend(&self) -> &'static str {
        self.backend.name()
    }

    fn to_universal(&self, message: &OpenAIMessage) -> Result<ContentRecord, ConversionError> {
        let record = match message.role.as_str() {
            "user" => {
                let blocks = Self::user_blocks(message.content.as_ref());
                if blocks.is_empty() {
                    return Err(ConversionError::EmptyMessage {
                        backend: self.backend.name(),
                    });
                }
                ContentRecord::new(Speaker::Human, blocks)?
            }
            "assistant" => ContentRecord::new(Speaker::Ai, self.assistant_blocks(message))?,
            "tool" => {
                let raw = match &message.content {
                    Some(OpenAIContent::Text(text)) => text.clone(),
                    Some(OpenAIContent::Parts(parts)) => parts
                        .iter()
                        .filter_map(|part| match part {
                            OpenAIContentPart::Text { text } => Some(text.as_str()),
                            OpenAIContentPart::ImageUrl { .. } => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                    None => String::new(),
                };
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                ContentRecord::new(
                    Speaker::Tool,
                    vec![ContentBlock::tool_response(
                        ids::canonicalize(call_id),
                        message.name.clone().unwrap_or_default(),
                        parse_tool_output(&raw),
                    )],
                )?
            }
            other => {
                return Err(ConversionError::UnsupportedRole {
                    backend: self.backend.name(),
                    role: other.to_string(),
                })
            }
        };

        Ok(record.with_provider(self.backend.name()))
    }

    fn from_universal(&self, record: &ContentRecord) -> Result<Vec<OpenAIMessage>, ConversionError> {
        match record.speaker {
            Speaker::Human => {
                let mut parts = Vec::new();
                let mut has_media = false;
                for block in &record.blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            parts.push(OpenAIContentPart::Text { text: text.clone() })
                        }
                        ContentBlock::Media {
                            mime_type,
                            data,
                            encoding,
                        } => {
                            has_media = true;
                            parts.push(media_to_part(mime_type, data, *encoding));
                        }
                        ContentBlock::Code {
                            code,
                            language,
                            execution_result,
                            ..
                        } => parts.push(OpenAIContentPart::Text {
                            text: render_code(code, language.as_deref(), execution_result.as_deref()),
                        }),
                        _ => {}
                    }
                }
                if parts.is_empty() {
                    return Ok(Vec::new());
                }

                let content = if has_media {
                    OpenAIContent::Parts(parts)
                } else {
                    let text = parts
                        .into_iter()
                        .filter_map(|part| match part {
                            OpenAIContentPart::Text { text } => Some(text),
                            OpenAIContentPart::ImageUrl { .. } => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    OpenAIContent::Text(text)
                };
                Ok(vec![OpenAIMessage {
                    content: Some(content),
                    ..OpenAIMessage::text("user", "")
                }])
            }
            Speaker::Ai => {
                let mut text = String::new();
                let mut reasoning = String::new();
                let mut tool_calls = Vec::new();

                for block in &record.blocks {
                    match block {
                        ContentBlock::Text { text: more } => text.push_str(more),
                        ContentBlock::Thinking {
                            thought,
                            source_field,
                            is_hidden,
                            ..
                        } => {
                            if *is_hidden || thought.is_empty() {
                                continue;
                            }
                            if *source_field == ThinkingSource::ThinkTags {
                                text.push_str(&format!("<think>{}</think>", thought));
                            } else {
                                reasoning.push_str(thought);
                            }
                        }
                        ContentBlock::ToolCall {
                            id,
                            name,
                            parameters,
                            ..
                        } => tool_calls.push(OpenAIToolCall {
                            id: ids::to_native(id, NATIVE_PREFIX),
                            call_type: function_type(),
                            function: OpenAIFunctionCall {
                                name: name.clone(),
                                arguments: serde_json::to_string(parameters).map_err(|source| {
                                    ConversionError::Encode {
                                        what: "tool arguments",
                                        source,
                                    }
                                })?,
                            },
                        }),
                        ContentBlock::Code {
                            code,
                            language,
                            execution_result,
                            ..
                        } => text.push_str(&render_code(
                            code,
                            language.as_deref(),
                            execution_result.as_deref(),
                        )),
                        ContentBlock::Media { .. } | ContentBlock::ToolResponse { .. } => {}
                    }
                }

                if text.is_empty() && reasoning.is_empty() && tool_calls.is_empty() {
                    return Ok(Vec::new());
                }

                Ok(vec![OpenAIMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty() || tool_calls.is_empty())
                        .then(|| OpenAIContent::Text(text)),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls,
                    tool_call_id: None,
                    name: None,
                }])
            }
            Speaker::Tool => {
                let mut messages = Vec::new();
                for block in &record.blocks {
                    if let ContentBlock::ToolResponse {
                        call_id,
                        tool_name,
                        result,
                        error,
                    } = block
                    {
                        messages.push(OpenAIMessage {
                            tool_call_id: Some(ids::to_native(call_id, NATIVE_PREFIX)),
                            name: (!tool_name.is_empty()).then(|| tool_name.clone()),
                            ..OpenAIMessage::text("tool", render_tool_output(result, error.as_deref()))
                        });
                    }
                }
                Ok(messages)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_with_call() -> OpenAIMessage {
        serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "reasoning_content": "need the file",
            "tool_calls": [{
                "id": "call_abc123",
                "type": "function",
                "function": {"name": "read_file", "arguments": "{\"path\":\"a.rs\"}"}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_assistant_to_universal() {
        let record = OpenAIConverter::default()
            .to_universal(&assistant_with_call())
            .unwrap();

        assert_eq!(record.speaker, Speaker::Ai);
        assert_eq!(record.metadata.provider.as_deref(), Some("openai"));
        assert!(matches!(
            &record.blocks[0],
            ContentBlock::Thinking { source_field: ThinkingSource::ReasoningContent, .. }
        ));
        match &record.blocks[1] {
            ContentBlock::ToolCall { id, parameters, .. } => {
                assert_eq!(id, "hist_tool_abc123");
                assert_eq!(parameters, &json!({"path": "a.rs"}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_restores_native_ids() {
        let converter = OpenAIConverter::default();
        let original = assistant_with_call();
        let record = converter.to_universal(&original).unwrap();
        let back = converter.from_universal(&record).unwrap();

        assert_eq!(back.len(), 1);
        assert_eq!(back[0].tool_calls[0].id, "call_abc123");
        assert_eq!(back[0].reasoning_content.as_deref(), Some("need the file"));
        assert!(back[0].content.is_none());
    }

    #[test]
    fn test_tool_record_splits_into_messages() {
        let record = ContentRecord::tool(vec![
            ContentBlock::tool_response("hist_tool_a", "read", json!({"lines": 3})),
            ContentBlock::ToolResponse {
                call_id: "hist_tool_b".to_string(),
                tool_name: "write".to_string(),
                result: json!(null),
                error: Some("permission denied".to_string()),
            },
        ])
        .unwrap();

        let messages = OpenAIConverter::default().from_universal(&record).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(
            messages[0].content,
            Some(OpenAIContent::Text("{\"lines\":3}".to_string()))
        );
        assert_eq!(
            messages[1].content,
            Some(OpenAIContent::Text("permission denied".to_string()))
        );
    }

    #[test]
    fn test_think_tags_for_local_backends() {
        let converter = OpenAIConverter::for_backend(BackendKind::Local);
        let message = OpenAIMessage::text("assistant", "<think>check docs</think>Use serde.");
        let record = converter.to_universal(&message).unwrap();

        assert_eq!(record.blocks.len(), 2);
        assert!(matches!(
            &record.blocks[0],
            ContentBlock::Thinking { source_field: ThinkingSource::ThinkTags, thought, .. } if thought == "check docs"
        ));

        let back = converter.from_universal(&record).unwrap();
        assert_eq!(
            back[0].content,
            Some(OpenAIContent::Text("<think>check docs</think>Use serde.".to_string()))
        );
    }

    #[test]
    fn test_data_url_becomes_base64_media() {
        let message: OpenAIMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]
        }))
        .unwrap();

        let record = OpenAIConverter::default().to_universal(&message).unwrap();
        assert_eq!(
            record.blocks[1],
            ContentBlock::Media {
                mime_type: "image/png".to_string(),
                data: "AAAA".to_string(),
                encoding: MediaEncoding::Base64,
            }
        );
    }

    #[test]
    fn test_system_role_rejected() {
        let message = OpenAIMessage::text("system", "be brief");
        assert!(matches!(
            OpenAIConverter::default().to_universal(&message),
            Err(ConversionError::UnsupportedRole { .. })
        ));
    }
}
