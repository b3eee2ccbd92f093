// Universal conversation content
//
// Every backend's wire format is converted to and from these types. Records
// are append-only once they reach the history engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::ContentError;

pub mod ids;

/// Who produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Human,
    Ai,
    Tool,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Human => "human",
            Speaker::Ai => "ai",
            Speaker::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire field a reasoning trace originally arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingSource {
    /// OpenAI-compatible `reasoning_content`
    ReasoningContent,
    /// Anthropic `thinking` blocks
    Thinking,
    /// Gemini `thought` parts
    Thought,
    /// `<think>...</think>` tags embedded in plain text
    ThinkTags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaEncoding {
    Url,
    Base64,
}

/// One ordered piece of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        parameters: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    ToolResponse {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Thinking {
        thought: String,
        #[serde(rename = "sourceField")]
        source_field: ThinkingSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(rename = "isHidden", default, skip_serializing_if = "is_false")]
        is_hidden: bool,
    },
    Media {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
        encoding: MediaEncoding,
    },
    Code {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        executed: Option<bool>,
        #[serde(
            rename = "executionResult",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        execution_result: Option<String>,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, parameters: Value) -> Self {
        ContentBlock::ToolCall {
            id: id.into(),
            name: name.into(),
            parameters,
            description: None,
        }
    }

    pub fn tool_response(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
    ) -> Self {
        ContentBlock::ToolResponse {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            result,
            error: None,
        }
    }

    pub fn thinking(thought: impl Into<String>, source_field: ThinkingSource) -> Self {
        ContentBlock::Thinking {
            thought: thought.into(),
            source_field,
            signature: None,
            is_hidden: false,
        }
    }

    /// Text of a text block, if this is one
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, ContentBlock::ToolCall { .. })
    }

    pub fn is_tool_response(&self) -> bool {
        matches!(self, ContentBlock::ToolResponse { .. })
    }

    /// Blocks that carry nothing worth sending anywhere
    pub fn is_blank(&self) -> bool {
        match self {
            ContentBlock::Text { text } => text.trim().is_empty(),
            ContentBlock::Thinking {
                thought, signature, ..
            } => thought.is_empty() && signature.is_none(),
            _ => false,
        }
    }

    /// Rough character weight used for token estimation
    pub fn char_weight(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::ToolCall {
                name, parameters, ..
            } => name.len() + parameters.to_string().len(),
            ContentBlock::ToolResponse { result, error, .. } => {
                result.to_string().len() + error.as_ref().map_or(0, |e| e.len())
            }
            ContentBlock::Thinking { thought, .. } => thought.len(),
            // Media payloads are billed by the backend, not by length
            ContentBlock::Media { .. } => 0,
            ContentBlock::Code {
                code,
                execution_result,
                ..
            } => code.len() + execution_result.as_ref().map_or(0, |r| r.len()),
        }
    }
}

/// Token usage reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Turn key mixed into canonical tool IDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Backend-native tool call ids mapped to the canonical ids in this record
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub native_tool_ids: BTreeMap<String, String>,
}

/// A single conversation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub speaker: Speaker,
    pub blocks: Vec<ContentBlock>,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl ContentRecord {
    /// Build a record, checking the content invariants
    pub fn new(speaker: Speaker, blocks: Vec<ContentBlock>) -> Result<Self, ContentError> {
        let record = Self {
            speaker,
            blocks,
            metadata: RecordMetadata {
                created_at: Some(Utc::now()),
                ..RecordMetadata::default()
            },
        };
        record.validate()?;
        Ok(record)
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Human,
            blocks: vec![ContentBlock::text(text)],
            metadata: RecordMetadata {
                created_at: Some(Utc::now()),
                ..RecordMetadata::default()
            },
        }
    }

    /// An assistant record; tool responses are not allowed here
    pub fn ai(blocks: Vec<ContentBlock>) -> Result<Self, ContentError> {
        Self::new(Speaker::Ai, blocks)
    }

    pub fn tool(blocks: Vec<ContentBlock>) -> Result<Self, ContentError> {
        Self::new(Speaker::Tool, blocks)
    }

    /// A partial assistant record as produced by a streaming adapter
    pub(crate) fn delta(block: ContentBlock) -> Self {
        Self {
            speaker: Speaker::Ai,
            blocks: vec![block],
            metadata: RecordMetadata::default(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.metadata.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }

    pub fn with_turn_id(mut self, turn_id: impl Into<String>) -> Self {
        self.metadata.turn_id = Some(turn_id.into());
        self
    }

    /// Check the invariants every record must satisfy
    pub fn validate(&self) -> Result<(), ContentError> {
        let mut has_response = false;

        for block in &self.blocks {
            match block {
                ContentBlock::ToolResponse { call_id, .. } => {
                    if self.speaker != Speaker::Tool {
                        return Err(ContentError::MisplacedToolResponse {
                            speaker: self.speaker.to_string(),
                        });
                    }
                    if call_id.trim().is_empty() {
                        return Err(ContentError::EmptyResponseCallId);
                    }
                    has_response = true;
                }
                ContentBlock::ToolCall { id, .. } => {
                    if self.speaker != Speaker::Ai {
                        return Err(ContentError::MisplacedToolCall {
                            speaker: self.speaker.to_string(),
                        });
                    }
                    if id.trim().is_empty() {
                        return Err(ContentError::EmptyToolCallId);
                    }
                }
                _ => {}
            }
        }

        if self.speaker == Speaker::Tool && !has_response {
            return Err(ContentError::ToolRecordWithoutResponse);
        }

        Ok(())
    }

    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| block.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ContentBlock> {
        self.blocks.iter().filter(|block| block.is_tool_call())
    }

    pub fn tool_responses(&self) -> impl Iterator<Item = &ContentBlock> {
        self.blocks.iter().filter(|block| block.is_tool_response())
    }

    /// Records with no blocks, or only blank text/thinking, are filler
    pub fn is_empty_filler(&self) -> bool {
        self.blocks.iter().all(|block| block.is_blank())
    }

    /// Rough token estimate (1 token ≈ 4 characters)
    pub fn estimated_tokens(&self) -> usize {
        let chars: usize = self.blocks.iter().map(|block| block.char_weight()).sum();
        chars.div_ceil(4)
    }
}
