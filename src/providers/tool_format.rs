// Tool definition formats
//
// The same tool list is rendered differently per backend. Qwen models accept
// the OpenAI shape but are picky about schemas with `$schema`/`strict`, and
// Gemini rejects several JSON-schema keywords outright.

use serde_json::{json, Value};

use super::types::ToolDefinition;

/// JSON-schema keywords Gemini's function declarations do not accept
const GEMINI_UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "additionalProperties",
    "patternProperties",
    "unevaluatedProperties",
    "strict",
    "examples",
    "const",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFormat {
    OpenAI,
    Qwen,
    Anthropic,
    Gemini,
}

impl ToolFormat {
    pub fn parse(name: &str) -> Option<ToolFormat> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ToolFormat::OpenAI),
            "qwen" => Some(ToolFormat::Qwen),
            "anthropic" => Some(ToolFormat::Anthropic),
            "gemini" => Some(ToolFormat::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolFormat::OpenAI => "openai",
            ToolFormat::Qwen => "qwen",
            ToolFormat::Anthropic => "anthropic",
            ToolFormat::Gemini => "gemini",
        }
    }

    /// Pick a format: the `toolFormat` setting if valid, otherwise by model name
    pub fn detect(model: &str, configured: Option<&str>, fallback: ToolFormat) -> ToolFormat {
        if let Some(format) = configured.and_then(ToolFormat::parse) {
            return format;
        }
        let model = model.to_ascii_lowercase();
        if model.contains("qwen") {
            ToolFormat::Qwen
        } else if model.contains("claude") {
            ToolFormat::Anthropic
        } else if model.contains("gemini") {
            ToolFormat::Gemini
        } else {
            fallback
        }
    }

    /// Render tool definitions for the wire
    ///
    /// OpenAI and Qwen produce `[{type: function, function: {...}}]`,
    /// Anthropic `[{name, description, input_schema}]`, Gemini a single
    /// `{functionDeclarations: [...]}` entry.
    pub fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<Value> {
        if tools.is_empty() {
            return Vec::new();
        }

        match self {
            ToolFormat::OpenAI => tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
            ToolFormat::Qwen => tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": strip_keywords(&tool.parameters, &["$schema", "strict"]),
                        }
                    })
                })
                .collect(),
            ToolFormat::Anthropic => tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
            ToolFormat::Gemini => {
                let declarations: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": strip_keywords(&tool.parameters, GEMINI_UNSUPPORTED_KEYWORDS),
                        })
                    })
                    .collect();
                vec![json!({ "functionDeclarations": declarations })]
            }
        }
    }
}

/// Remove `keywords` from a schema, recursively
fn strip_keywords(schema: &Value, keywords: &[&str]) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !keywords.contains(&key.as_str()))
                .map(|(key, value)| match (key.as_str(), value) {
                    // Property names are user data, not keywords
                    ("properties", Value::Object(properties)) => (
                        key.clone(),
                        Value::Object(
                            properties
                                .iter()
                                .map(|(name, prop)| (name.clone(), strip_keywords(prop, keywords)))
                                .collect(),
                        ),
                    ),
                    _ => (key.clone(), strip_keywords(value, keywords)),
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| strip_keywords(item, keywords))
                .collect(),
        ),
        other => other.clone(),
    }
}
