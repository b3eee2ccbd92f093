// Provider-agnostic request types
//
// Adapters turn a `CompletionRequest` into their own wire request. Conversation
// content is always in universal form here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::ContentRecord;

/// A tool the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Unified completion request
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Curated conversation, oldest first
    pub contents: Vec<ContentRecord>,

    /// Explicit model; wins over settings and the backend default
    pub model: Option<String>,

    pub system_prompt: Option<String>,

    pub tools: Vec<ToolDefinition>,

    /// Overrides the provider's `maxTokens` setting
    pub max_tokens: Option<u32>,

    pub temperature: Option<f32>,

    /// Turn key for ids the backend leaves out (Gemini)
    pub turn_id: Option<String>,
}

impl CompletionRequest {
    pub fn new(contents: Vec<ContentRecord>) -> Self {
        Self {
            contents,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_turn_id(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }
}

/// A model offered by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }
}
