// Streaming accumulators
//
// Helpers shared by the streaming adapters: tool call argument assembly,
// delta folding, break-point text buffering and <think> tag splitting.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::content::{ids, ContentBlock, ContentRecord, RecordMetadata, Speaker};

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Assembles tool calls whose pieces arrive across many chunks
///
/// Pieces are keyed by the stream index the backend assigns. Arguments stay
/// raw until `finish`, where they are parsed exactly once.
#[derive(Debug)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialToolCall>,
    turn_key: String,
    backend: String,
}

impl ToolCallAccumulator {
    pub fn new(turn_key: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            calls: BTreeMap::new(),
            turn_key: turn_key.into(),
            backend: backend.into(),
        }
    }

    pub fn push(&mut self, index: usize, id: Option<&str>, name: Option<&str>, fragment: &str) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|id| !id.trim().is_empty()) {
            call.id = Some(id.to_string());
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            call.name = name.to_string();
        }
        call.arguments.push_str(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed tool calls in stream-index order, as one partial record
    ///
    /// Ids are derived from the turn key and stream index, so a backend that
    /// reuses ids across turns or omits them still yields distinct, stable
    /// ones. Native ids are kept in `native_tool_ids` for response lookup.
    pub fn finish(&mut self) -> Option<ContentRecord> {
        if self.calls.is_empty() {
            return None;
        }

        let mut native_tool_ids = BTreeMap::new();
        let blocks = std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, call)| {
                let id = ids::generate_canonical_id(
                    &self.turn_key,
                    index,
                    &self.backend,
                    call.id.as_deref(),
                    &call.name,
                );
                if let Some(raw) = call.id {
                    native_tool_ids.insert(raw, id.clone());
                }
                ContentBlock::ToolCall {
                    id,
                    name: call.name,
                    parameters: normalize_arguments(&call.arguments),
                    description: None,
                }
            })
            .collect();

        Some(ContentRecord {
            speaker: Speaker::Ai,
            blocks,
            metadata: RecordMetadata {
                native_tool_ids,
                ..RecordMetadata::default()
            },
        })
    }
}

/// Parse tool arguments, unwrapping JSON that was encoded twice
pub fn normalize_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Default::default());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(value @ Value::Object(_)) | Ok(value @ Value::Array(_)) => value,
            _ => Value::String(inner),
        },
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("tool arguments are not valid JSON, keeping raw text: {}", e);
            Value::String(raw.to_string())
        }
    }
}

/// Folds streamed partial records into one assistant record
#[derive(Debug, Default)]
pub struct DeltaMerger {
    blocks: Vec<ContentBlock>,
    metadata: RecordMetadata,
}

impl DeltaMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ContentRecord) {
        for block in &delta.blocks {
            self.push_block(block);
        }

        let meta = &delta.metadata;
        if meta.usage.is_some() {
            self.metadata.usage = meta.usage;
        }
        if meta.model.is_some() {
            self.metadata.model = meta.model.clone();
        }
        if meta.provider.is_some() {
            self.metadata.provider = meta.provider.clone();
        }
        self.metadata.native_tool_ids.extend(
            meta.native_tool_ids
                .iter()
                .map(|(native, canonical)| (native.clone(), canonical.clone())),
        );
    }

    fn push_block(&mut self, block: &ContentBlock) {
        match (self.blocks.last_mut(), block) {
            (Some(ContentBlock::Text { text }), ContentBlock::Text { text: more }) => {
                text.push_str(more);
            }
            (
                Some(ContentBlock::Thinking {
                    thought,
                    source_field,
                    signature,
                    is_hidden: false,
                }),
                ContentBlock::Thinking {
                    thought: more,
                    source_field: more_source,
                    signature: more_signature,
                    is_hidden: false,
                },
            ) if source_field == more_source => {
                thought.push_str(more);
                if more_signature.is_some() {
                    *signature = more_signature.clone();
                }
            }
            _ => self.blocks.push(block.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn finish(self) -> ContentRecord {
        ContentRecord {
            speaker: Speaker::Ai,
            blocks: self.blocks,
            metadata: self.metadata,
        }
    }
}

/// Holds text back until a newline or sentence end
#[derive(Debug, Default)]
pub struct TextBuffer {
    pending: String,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text`, returning everything up to the last break point
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.pending.push_str(text);
        let cut = last_break(&self.pending)?;
        let rest = self.pending.split_off(cut);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

fn last_break(text: &str) -> Option<usize> {
    let mut last = None;
    let mut after_terminal = false;
    for (idx, ch) in text.char_indices() {
        if ch == '\n' || (after_terminal && ch.is_whitespace()) {
            last = Some(idx + ch.len_utf8());
        }
        after_terminal = matches!(ch, '.' | '!' | '?');
    }
    last
}

/// Output of [`ThinkTagSplitter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Thinking(String),
}

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Splits `<think>...</think>` sections out of streamed text
///
/// Tags may be cut anywhere across chunk boundaries; a possible partial tag
/// at the end of a chunk is held until the next one arrives.
#[derive(Debug, Default)]
pub struct ThinkTagSplitter {
    in_think: bool,
    carry: String,
}

impl ThinkTagSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(chunk);

        let mut out = Vec::new();
        loop {
            let tag = if self.in_think { CLOSE_TAG } else { OPEN_TAG };
            if let Some(pos) = buf.find(tag) {
                self.emit(&mut out, &buf[..pos]);
                self.in_think = !self.in_think;
                buf = buf[pos + tag.len()..].to_string();
                continue;
            }

            let held = (1..tag.len())
                .rev()
                .find(|&k| buf.ends_with(&tag[..k]))
                .unwrap_or(0);
            let split = buf.len() - held;
            self.emit(&mut out, &buf[..split]);
            self.carry = buf[split..].to_string();
            return out;
        }
    }

    /// Flush any held text at end of stream
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let carry = std::mem::take(&mut self.carry);
        self.emit(&mut out, &carry);
        out
    }

    fn emit(&self, out: &mut Vec<Segment>, text: &str) {
        if text.is_empty() {
            return;
        }
        let segment = if self.in_think {
            Segment::Thinking(text.to_string())
        } else {
            Segment::Text(text.to_string())
        };
        out.push(segment);
    }
}

/// Split a complete message into text and thinking segments
pub fn split_think_tags(text: &str) -> Vec<Segment> {
    let mut splitter = ThinkTagSplitter::new();
    let mut segments = splitter.push(text);
    segments.extend(splitter.finish());
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ThinkingSource;
    use serde_json::json;

    #[test]
    fn test_accumulator_orders_by_index() {
        let mut acc = ToolCallAccumulator::new("turn-1", "openai");
        acc.push(1, Some("call_b"), Some("write"), "{\"path\":");
        acc.push(0, Some("call_a"), Some("read"), "{\"path\": \"a\"}");
        acc.push(1, None, None, "\"b\"}");

        let record = acc.finish().unwrap();
        assert_eq!(record.blocks.len(), 2);
        let expected = ids::generate_canonical_id("turn-1", 1, "openai", Some("call_b"), "write");
        match &record.blocks[1] {
            ContentBlock::ToolCall {
                id,
                name,
                parameters,
                ..
            } => {
                assert_eq!(id, &expected);
                assert_eq!(name, "write");
                assert_eq!(parameters, &json!({"path": "b"}));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(record.metadata.native_tool_ids.get("call_b"), Some(&expected));
        assert_eq!(record.metadata.native_tool_ids.len(), 2);
        assert!(acc.is_empty());
        assert!(acc.finish().is_none());
    }

    #[test]
    fn test_double_encoded_arguments() {
        assert_eq!(
            normalize_arguments("\"{\\\"q\\\": 1}\""),
            json!({"q": 1})
        );
        assert_eq!(normalize_arguments(""), json!({}));
        assert_eq!(normalize_arguments("not json"), json!("not json"));
    }

    fn single_call_id(turn_key: &str, raw: Option<&str>) -> String {
        let mut acc = ToolCallAccumulator::new(turn_key, "local");
        acc.push(0, raw, Some("ls"), "{}");
        match &acc.finish().unwrap().blocks[0] {
            ContentBlock::ToolCall { id, .. } => id.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_id_is_stable_per_turn() {
        let first = single_call_id("turn-1", None);
        assert!(ids::is_canonical(&first));
        assert_eq!(first, single_call_id("turn-1", None));
        assert_ne!(first, single_call_id("turn-2", None));
    }

    #[test]
    fn test_reused_native_id_differs_across_turns() {
        let first = single_call_id("turn-1", Some("call_0"));
        let second = single_call_id("turn-2", Some("call_0"));
        assert_ne!(first, second);
        assert_ne!(first, "hist_tool_0");
    }

    #[test]
    fn test_merger_collects_native_ids() {
        let mut acc = ToolCallAccumulator::new("turn-1", "openai");
        acc.push(0, Some("call_a"), Some("read"), "{}");
        let calls = acc.finish().unwrap();

        let mut merger = DeltaMerger::new();
        merger.push(&ContentRecord::delta(ContentBlock::text("Reading.")));
        merger.push(&calls);
        let record = merger.finish();

        assert_eq!(record.blocks.len(), 2);
        assert_eq!(record.metadata.native_tool_ids, calls.metadata.native_tool_ids);
    }

    #[test]
    fn test_merger_concatenates_like_blocks() {
        let mut merger = DeltaMerger::new();
        merger.push(&ContentRecord::delta(ContentBlock::thinking(
            "Let me ",
            ThinkingSource::ReasoningContent,
        )));
        merger.push(&ContentRecord::delta(ContentBlock::thinking(
            "think",
            ThinkingSource::ReasoningContent,
        )));
        merger.push(&ContentRecord::delta(ContentBlock::text("Hello")));
        merger.push(&ContentRecord::delta(ContentBlock::text(", world")));

        let record = merger.finish();
        assert_eq!(record.blocks.len(), 2);
        assert_eq!(record.text(), "Hello, world");
        assert!(matches!(
            &record.blocks[0],
            ContentBlock::Thinking { thought, .. } if thought == "Let me think"
        ));
    }

    #[test]
    fn test_text_buffer_breaks() {
        let mut buffer = TextBuffer::new();
        assert_eq!(buffer.push("Hello wor"), None);
        assert_eq!(buffer.push("ld. How"), Some("Hello world. ".to_string()));
        assert_eq!(buffer.push(" are\nyou"), Some("How are\n".to_string()));
        assert_eq!(buffer.flush(), Some("you".to_string()));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn test_think_tags_across_chunks() {
        let mut splitter = ThinkTagSplitter::new();
        let mut segments = splitter.push("<thi");
        segments.extend(splitter.push("nk>plan</th"));
        segments.extend(splitter.push("ink>answer"));
        segments.extend(splitter.finish());

        assert_eq!(
            segments,
            vec![
                Segment::Thinking("plan".to_string()),
                Segment::Text("answer".to_string())
            ]
        );
    }

    #[test]
    fn test_plain_text_with_angle_bracket() {
        assert_eq!(
            split_think_tags("a < b"),
            vec![Segment::Text("a < b".to_string())]
        );
    }
}
