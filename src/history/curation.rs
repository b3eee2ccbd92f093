// History curation
//
// Shapes the stored conversation into what a backend should see: filler
// records removed, reasoning filtered by policy, JSON payloads depth-capped.

use serde_json::{Map, Value};

use crate::content::{ContentBlock, ContentRecord, Speaker};

/// Deepest JSON nesting kept in curated tool payloads
pub const MAX_JSON_DEPTH: usize = 64;

/// Replaces anything nested deeper than `MAX_JSON_DEPTH`
pub const DEPTH_MARKER: &str = "[truncated: nesting too deep]";

/// Which thinking blocks survive curation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThinkingPolicy {
    /// Keep every thinking block
    #[default]
    All,
    /// Keep thinking only after the latest human record
    CurrentTurn,
    /// Drop all thinking blocks
    None,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CurationOptions {
    pub thinking: ThinkingPolicy,
}

impl CurationOptions {
    pub fn with_thinking(thinking: ThinkingPolicy) -> Self {
        Self { thinking }
    }
}

/// Copy `value`, replacing subtrees below `max_depth` with the marker
pub fn sanitize_value(value: &Value, max_depth: usize) -> Value {
    fn walk(value: &Value, depth: usize, max_depth: usize) -> Value {
        match value {
            Value::Array(_) | Value::Object(_) if depth >= max_depth => {
                Value::String(DEPTH_MARKER.to_string())
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| walk(item, depth + 1, max_depth))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), walk(item, depth + 1, max_depth)))
                    .collect::<Map<String, Value>>(),
            ),
            scalar => scalar.clone(),
        }
    }

    walk(value, 0, max_depth)
}

fn sanitize_block(block: &ContentBlock) -> ContentBlock {
    match block {
        ContentBlock::ToolCall {
            id,
            name,
            parameters,
            description,
        } => ContentBlock::ToolCall {
            id: id.clone(),
            name: name.clone(),
            parameters: sanitize_value(parameters, MAX_JSON_DEPTH),
            description: description.clone(),
        },
        ContentBlock::ToolResponse {
            call_id,
            tool_name,
            result,
            error,
        } => ContentBlock::ToolResponse {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            result: sanitize_value(result, MAX_JSON_DEPTH),
            error: error.clone(),
        },
        other => other.clone(),
    }
}

/// Build the provider-facing view of `records`
pub(crate) fn curate(records: &[ContentRecord], options: &CurationOptions) -> Vec<ContentRecord> {
    let current_turn_start = records
        .iter()
        .rposition(|record| record.speaker == Speaker::Human)
        .unwrap_or(0);

    records
        .iter()
        .enumerate()
        .filter(|(_, record)| !record.is_empty_filler())
        .filter_map(|(index, record)| {
            let keep_thinking = match options.thinking {
                ThinkingPolicy::All => true,
                ThinkingPolicy::CurrentTurn => index >= current_turn_start,
                ThinkingPolicy::None => false,
            };

            let blocks: Vec<ContentBlock> = record
                .blocks
                .iter()
                .filter(|block| keep_thinking || !matches!(block, ContentBlock::Thinking { .. }))
                .map(sanitize_block)
                .collect();

            let curated = ContentRecord {
                speaker: record.speaker,
                blocks,
                metadata: record.metadata.clone(),
            };
            (!curated.is_empty_filler()).then_some(curated)
        })
        .collect()
}
