// Content converters
//
// Each backend family gets a converter between its wire message shape and
// `ContentRecord`. Tool ids are canonicalized on the way in and restored to
// the backend's native prefix on the way out.

use crate::content::ContentRecord;
use crate::errors::ConversionError;

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod stream;

pub use anthropic::AnthropicConverter;
pub use gemini::GeminiConverter;
pub use openai::OpenAIConverter;

/// Bidirectional mapping between one wire format and the universal model
pub trait ContentConverter {
    /// Wire message type
    type Wire;

    /// Backend name recorded as `metadata.provider` on converted records
    fn backend(&self) -> &'static str;

    fn to_universal(&self, message: &Self::Wire) -> Result<ContentRecord, ConversionError>;

    /// One record may need several wire messages (OpenAI sends one message per
    /// tool result); an empty result means nothing is sendable.
    fn from_universal(&self, record: &ContentRecord) -> Result<Vec<Self::Wire>, ConversionError>;

    /// Convert a whole conversation, in order
    fn from_history(&self, records: &[ContentRecord]) -> Result<Vec<Self::Wire>, ConversionError> {
        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            messages.extend(self.from_universal(record)?);
        }
        Ok(messages)
    }
}

/// Tool results travel as strings on most wires; JSON-looking strings are
/// parsed back into values.
pub(crate) fn parse_tool_output(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    serde_json::Value::String(raw.to_string())
}

pub(crate) fn render_tool_output(result: &serde_json::Value, error: Option<&str>) -> String {
    if let Some(error) = error {
        return error.to_string();
    }
    match result {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render a code block as fenced markdown for wires without a code part
pub(crate) fn render_code(code: &str, language: Option<&str>, execution_result: Option<&str>) -> String {
    let mut text = format!("```{}\n{}\n```", language.unwrap_or(""), code);
    if let Some(output) = execution_result {
        text.push_str("\n\nOutput:\n```\n");
        text.push_str(output);
        text.push_str("\n```");
    }
    text
}
