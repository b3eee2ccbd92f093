// Gemini contents converter
//
// Gemini function calls may come without ids. Those are given canonical ids
// derived from (turn key, position, name), so a call and its response in the
// same turn land on the same id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::ContentConverter;
use crate::content::{
    ids, ContentBlock, ContentRecord, MediaEncoding, Speaker, ThinkingSource,
};
use crate::errors::ConversionError;

const BACKEND: &str = "gemini";
const OUTPUT_KEY: &str = "output";
const ERROR_KEY: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

/// One part; exactly one payload field is expected to be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<GeminiBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<GeminiFileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_code: Option<GeminiExecutableCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_execution_result: Option<GeminiCodeExecutionResult>,
}

impl GeminiPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiBlob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFileData {
    #[serde(default)]
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiExecutableCode {
    #[serde(default)]
    pub language: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiCodeExecutionResult {
    #[serde(default)]
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Converter for Gemini `contents`
#[derive(Debug, Clone, Default)]
pub struct GeminiConverter {
    turn_key: Option<String>,
}

impl GeminiConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn key used to derive ids for calls and responses that lack one
    pub fn with_turn_key(turn_key: impl Into<String>) -> Self {
        Self {
            turn_key: Some(turn_key.into()),
        }
    }

    pub(crate) fn turn_key(&self) -> &str {
        self.turn_key.as_deref().unwrap_or("gemini")
    }

    /// Canonical id for a call or response, derived when the wire omits it
    pub fn tool_id(&self, id: Option<&str>, position: usize, name: &str) -> String {
        match id.filter(|id| !id.trim().is_empty()) {
            Some(id) => ids::canonicalize(id),
            None => ids::generate_canonical_id(self.turn_key(), position, BACKEND, None, name),
        }
    }
}

/// Gemini wants an object; wrap scalars and surface errors under fixed keys
fn response_payload(result: &Value, error: Option<&str>) -> Value {
    if let Some(error) = error {
        return json!({ ERROR_KEY: error });
    }
    match result {
        Value::Object(_) => result.clone(),
        other => json!({ OUTPUT_KEY: other }),
    }
}

fn unwrap_response(response: &Value) -> (Value, Option<String>) {
    if let Value::Object(map) = response {
        if map.len() == 1 {
            if let Some(output) = map.get(OUTPUT_KEY) {
                return (output.clone(), None);
            }
            if let Some(Value::String(error)) = map.get(ERROR_KEY) {
                return (Value::Null, Some(error.clone()));
            }
        }
    }
    (response.clone(), None)
}

impl ContentConverter for GeminiConverter {
    type Wire = GeminiContent;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn to_universal(&self, content: &GeminiContent) -> Result<ContentRecord, ConversionError> {
        let mut blocks: Vec<ContentBlock> = Vec::new();
        let mut call_position = 0;
        let mut response_position = 0;

        for part in &content.parts {
            if let Some(call) = &part.function_call {
                blocks.push(ContentBlock::ToolCall {
                    id: self.tool_id(call.id.as_deref(), call_position, &call.name),
                    name: call.name.clone(),
                    parameters: if call.args.is_null() {
                        Value::Object(Map::new())
                    } else {
                        call.args.clone()
                    },
                    description: None,
                });
                call_position += 1;
            } else if let Some(response) = &part.function_response {
                let (result, error) = unwrap_response(&response.response);
                blocks.push(ContentBlock::ToolResponse {
                    call_id: self.tool_id(response.id.as_deref(), response_position, &response.name),
                    tool_name: response.name.clone(),
                    result,
                    error,
                });
                response_position += 1;
            } else if let Some(text) = &part.text {
                if part.thought.unwrap_or(false) {
                    blocks.push(ContentBlock::Thinking {
                        thought: text.clone(),
                        source_field: ThinkingSource::Thought,
                        signature: part.thought_signature.clone(),
                        is_hidden: false,
                    });
                } else {
                    blocks.push(ContentBlock::text(text.clone()));
                }
            } else if let Some(blob) = &part.inline_data {
                blocks.push(ContentBlock::Media {
                    mime_type: blob.mime_type.clone(),
                    data: blob.data.clone(),
                    encoding: MediaEncoding::Base64,
                });
            } else if let Some(file) = &part.file_data {
                blocks.push(ContentBlock::Media {
                    mime_type: file.mime_type.clone(),
                    data: file.file_uri.clone(),
                    encoding: MediaEncoding::Url,
                });
            } else if let Some(code) = &part.executable_code {
                blocks.push(ContentBlock::Code {
                    code: code.code.clone(),
                    language: Some(code.language.to_ascii_lowercase()),
                    executed: Some(false),
                    execution_result: None,
                });
            } else if let Some(result) = &part.code_execution_result {
                // Results follow the code they belong to
                match blocks.last_mut() {
                    Some(ContentBlock::Code {
                        executed,
                        execution_result,
                        ..
                    }) => {
                        *executed = Some(true);
                        *execution_result = result.output.clone();
                    }
                    _ => blocks.push(ContentBlock::Code {
                        code: String::new(),
                        language: None,
                        executed: Some(true),
                        execution_result: result.output.clone(),
                    }),
                }
            }
        }

        let speaker = match content.role.as_str() {
            "user" | "function" if blocks.iter().any(ContentBlock::is_tool_response) => Speaker::Tool,
            "user" => Speaker::Human,
            "model" => Speaker::Ai,
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

    fn from_universal(&self, record: &ContentRecord) -> Result<Vec<GeminiContent>, ConversionError> {
        let mut parts = Vec::new();

        for block in &record.blocks {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(GeminiPart::text(text.clone()));
                    }
                }
                ContentBlock::Thinking {
                    thought,
                    source_field: ThinkingSource::Thought,
                    signature,
                    is_hidden: false,
                } => parts.push(GeminiPart {
                    text: Some(thought.clone()),
                    thought: Some(true),
                    thought_signature: signature.clone(),
                    ..GeminiPart::default()
                }),
                ContentBlock::Thinking { .. } => {}
                ContentBlock::ToolCall {
                    id,
                    name,
                    parameters,
                    ..
                } => parts.push(GeminiPart {
                    function_call: Some(GeminiFunctionCall {
                        id: Some(ids::to_native(id, "")),
                        name: name.clone(),
                        args: parameters.clone(),
                    }),
                    ..GeminiPart::default()
                }),
                ContentBlock::ToolResponse {
                    call_id,
                    tool_name,
                    result,
                    error,
                } => parts.push(GeminiPart {
                    function_response: Some(GeminiFunctionResponse {
                        id: Some(ids::to_native(call_id, "")),
                        name: tool_name.clone(),
                        response: response_payload(result, error.as_deref()),
                    }),
                    ..GeminiPart::default()
                }),
                ContentBlock::Media {
                    mime_type,
                    data,
                    encoding,
                } => parts.push(match encoding {
                    MediaEncoding::Base64 => GeminiPart {
                        inline_data: Some(GeminiBlob {
                            mime_type: mime_type.clone(),
                            data: data.clone(),
                        }),
                        ..GeminiPart::default()
                    },
                    MediaEncoding::Url => GeminiPart {
                        file_data: Some(GeminiFileData {
                            mime_type: mime_type.clone(),
                            file_uri: data.clone(),
                        }),
                        ..GeminiPart::default()
                    },
                }),
                ContentBlock::Code {
                    code,
                    language,
                    executed,
                    execution_result,
                } => {
                    if !code.is_empty() {
                        parts.push(GeminiPart {
                            executable_code: Some(GeminiExecutableCode {
                                language: language.as_deref().unwrap_or("python").to_ascii_uppercase(),
                                code: code.clone(),
                            }),
                            ..GeminiPart::default()
                        });
                    }
                    if executed.unwrap_or(false) || execution_result.is_some() {
                        parts.push(GeminiPart {
                            code_execution_result: Some(GeminiCodeExecutionResult {
                                outcome: "OUTCOME_OK".to_string(),
                                output: execution_result.clone(),
                            }),
                            ..GeminiPart::default()
                        });
                    }
                }
            }
        }

        if parts.is_empty() {
            return Ok(Vec::new());
        }

        let role = match record.speaker {
            Speaker::Ai => "model",
            Speaker::Human | Speaker::Tool => "user",
        };
        Ok(vec![GeminiContent {
            role: role.to_string(),
            parts,
        }])
    }
}
