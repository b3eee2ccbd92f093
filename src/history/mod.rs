// Conversation history engine
//
// Append-only record of a conversation in universal form. Tool calls get
// canonical ids on append so responses can be paired with their calls no
// matter which backend produced either side.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::content::ids;
use crate::content::{ContentBlock, ContentRecord, Speaker};
use crate::errors::HistoryError;

mod curation;

pub use curation::{sanitize_value, CurationOptions, ThinkingPolicy, DEPTH_MARKER, MAX_JSON_DEPTH};

const EVENT_CAPACITY: usize = 256;
const UNKNOWN_BACKEND: &str = "unknown";

/// Notifications published by a history instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    RecordAppended { index: usize, speaker: Speaker },
    /// Emitted only when the running estimate actually changes
    TokensUpdated { total: usize },
    Cleared,
}

/// A tool call that has no response yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub record_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub records: usize,
    pub human_records: usize,
    pub ai_records: usize,
    pub tool_records: usize,
    pub tool_calls: usize,
    pub tool_responses: usize,
    pub unanswered_tool_calls: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone)]
struct CallEntry {
    name: String,
    record_index: usize,
    turn_key: String,
}

#[derive(Debug, Default)]
struct HistoryState {
    records: Vec<ContentRecord>,
    /// Canonical call id -> call info
    calls: HashMap<String, CallEntry>,
    /// Raw backend id (or a re-keyed canonical id) -> current canonical id;
    /// the latest call to claim an id wins
    aliases: HashMap<String, String>,
    /// Call order, for stable pending-call listings
    call_order: Vec<String>,
    answered: HashSet<String>,
    total_tokens: usize,
}

impl HistoryState {
    fn resolve(&self, id: &str) -> Option<String> {
        if let Some(canonical) = self.aliases.get(id) {
            return Some(canonical.clone());
        }
        if self.calls.contains_key(id) {
            return Some(id.to_string());
        }
        if id.trim().is_empty() {
            return None;
        }

        // Native ids of calls that arrived already canonicalized by a converter
        let canonical = ids::canonicalize(id);
        if let Some(aliased) = self.aliases.get(&canonical) {
            return Some(aliased.clone());
        }
        self.calls.contains_key(&canonical).then_some(canonical)
    }
}

/// Changes computed during validation and applied afterwards
struct PreparedAppend {
    record: ContentRecord,
    new_calls: Vec<(String, CallEntry)>,
    new_aliases: Vec<(String, String)>,
    answered: Vec<String>,
}

/// Canonical conversation store
///
/// Single writer, many readers. Curated views are computed per call and
/// returned as owned copies.
pub struct HistoryService {
    state: RwLock<HistoryState>,
    events: broadcast::Sender<HistoryEvent>,
}

impl Default for HistoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(HistoryState::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HistoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HistoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    /// Same as [`ids::generate_canonical_id`]
    pub fn generate_canonical_id(
        turn_key: &str,
        call_index: usize,
        backend: &str,
        raw_id: Option<&str>,
        tool_name: &str,
    ) -> String {
        ids::generate_canonical_id(turn_key, call_index, backend, raw_id, tool_name)
    }

    /// Append a record, returning its index
    ///
    /// Non-canonical tool call ids are replaced with canonical ones. Tool
    /// responses must reference a call already in the history (by canonical or
    /// raw id). Nothing changes if the record is rejected.
    pub fn append(&self, record: ContentRecord) -> Result<usize, HistoryError> {
        record.validate()?;

        let (index, speaker, tokens_changed) = {
            let mut state = self.write();
            let index = state.records.len();
            let prepared = prepare(&state, record, index)?;

            for (canonical, entry) in prepared.new_calls {
                state.call_order.push(canonical.clone());
                state.calls.insert(canonical, entry);
            }
            for (raw, canonical) in prepared.new_aliases {
                state.aliases.insert(raw, canonical);
            }
            state.answered.extend(prepared.answered);

            let previous_tokens = state.total_tokens;
            state.total_tokens += prepared.record.estimated_tokens();
            let speaker = prepared.record.speaker;
            state.records.push(prepared.record);

            let tokens_changed = (state.total_tokens != previous_tokens).then_some(state.total_tokens);
            (index, speaker, tokens_changed)
        };

        tracing::debug!(index, speaker = %speaker, "history record appended");
        let _ = self.events.send(HistoryEvent::RecordAppended { index, speaker });
        if let Some(total) = tokens_changed {
            let _ = self.events.send(HistoryEvent::TokensUpdated { total });
        }
        Ok(index)
    }

    /// Canonical id for a raw or canonical tool call id
    pub fn resolve_tool_id(&self, id: &str) -> Option<String> {
        self.read().resolve(id)
    }

    /// Conversation minus empty filler records
    ///
    /// Tool calls without responses are returned as they are.
    pub fn get_curated(&self) -> Vec<ContentRecord> {
        self.read()
            .records
            .iter()
            .filter(|record| !record.is_empty_filler())
            .cloned()
            .collect()
    }

    /// Backend-facing view: deep copies with depth-capped JSON payloads and
    /// thinking filtered by `options`
    pub fn get_curated_for_provider(&self, options: &CurationOptions) -> Vec<ContentRecord> {
        curation::curate(&self.read().records, options)
    }

    pub fn unanswered_tool_calls(&self) -> Vec<PendingToolCall> {
        let state = self.read();
        state
            .call_order
            .iter()
            .filter(|id| !state.answered.contains(*id))
            .filter_map(|id| {
                state.calls.get(id).map(|entry| PendingToolCall {
                    id: id.clone(),
                    name: entry.name.clone(),
                    record_index: entry.record_index,
                })
            })
            .collect()
    }

    pub fn statistics(&self) -> HistoryStats {
        let state = self.read();
        let mut stats = HistoryStats {
            records: state.records.len(),
            tool_calls: state.calls.len(),
            tool_responses: state.answered.len(),
            unanswered_tool_calls: state.calls.len() - state.answered.len(),
            total_tokens: state.total_tokens,
            ..HistoryStats::default()
        };
        for record in &state.records {
            match record.speaker {
                Speaker::Human => stats.human_records += 1,
                Speaker::Ai => stats.ai_records += 1,
                Speaker::Tool => stats.tool_records += 1,
            }
        }
        stats
    }

    pub fn record(&self, index: usize) -> Option<ContentRecord> {
        self.read().records.get(index).cloned()
    }

    pub fn records(&self) -> Vec<ContentRecord> {
        self.read().records.clone()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.read().total_tokens
    }

    pub fn clear(&self) {
        let had_tokens = {
            let mut state = self.write();
            let had_tokens = state.total_tokens != 0;
            *state = HistoryState::default();
            had_tokens
        };
        let _ = self.events.send(HistoryEvent::Cleared);
        if had_tokens {
            let _ = self.events.send(HistoryEvent::TokensUpdated { total: 0 });
        }
    }
}

fn prepare(
    state: &HistoryState,
    mut record: ContentRecord,
    index: usize,
) -> Result<PreparedAppend, HistoryError> {
    let mut new_calls: Vec<(String, CallEntry)> = Vec::new();
    let mut new_aliases: Vec<(String, String)> = Vec::new();
    let mut answered: Vec<String> = Vec::new();

    match record.speaker {
        Speaker::Ai => {
            let turn_key = record
                .metadata
                .turn_id
                .clone()
                .unwrap_or_else(|| index.to_string());
            let backend = record
                .metadata
                .provider
                .clone()
                .unwrap_or_else(|| UNKNOWN_BACKEND.to_string());

            let mut rekeyed: HashMap<String, String> = HashMap::new();
            let mut call_index = 0;
            for block in record.blocks.iter_mut() {
                let ContentBlock::ToolCall { id, name, .. } = block else {
                    continue;
                };

                let mut canonical = if ids::is_canonical(id) {
                    id.clone()
                } else {
                    let canonical = ids::generate_canonical_id(
                        &turn_key,
                        call_index,
                        &backend,
                        Some(id.as_str()),
                        name,
                    );
                    push_native_alias(&mut new_aliases, id.as_str(), &canonical);
                    canonical
                };

                // Backends reuse ids like `call_0` across turns, and `call_x`
                // and `toolu_x` share a canonical form. A collision with an
                // earlier turn gets a turn-scoped id; within a turn it is an error.
                if let Some(existing) = state.calls.get(&canonical) {
                    if existing.turn_key == turn_key {
                        return Err(HistoryError::DuplicateToolCall { id: canonical });
                    }
                    let fresh = ids::generate_canonical_id(
                        &turn_key,
                        call_index,
                        &backend,
                        Some(canonical.as_str()),
                        name,
                    );
                    tracing::debug!(reused = %canonical, id = %fresh, "tool call id reused from an earlier turn");
                    new_aliases.push((canonical.clone(), fresh.clone()));
                    rekeyed.insert(canonical, fresh.clone());
                    canonical = fresh;
                }
                call_index += 1;

                let seen = state.calls.contains_key(&canonical)
                    || new_calls.iter().any(|(existing, _)| *existing == canonical);
                if seen {
                    return Err(HistoryError::DuplicateToolCall { id: canonical });
                }

                *id = canonical.clone();
                new_calls.push((
                    canonical,
                    CallEntry {
                        name: name.clone(),
                        record_index: index,
                        turn_key: turn_key.clone(),
                    },
                ));
            }

            // Native ids a streaming adapter replaced with derived ones
            for canonical in record.metadata.native_tool_ids.values_mut() {
                if let Some(fresh) = rekeyed.get(canonical.as_str()) {
                    *canonical = fresh.clone();
                }
            }
            for (native, canonical) in &record.metadata.native_tool_ids {
                if new_calls.iter().any(|(id, _)| id == canonical) {
                    push_native_alias(&mut new_aliases, native, canonical);
                }
            }
        }
        Speaker::Tool => {
            for block in record.blocks.iter_mut() {
                let ContentBlock::ToolResponse {
                    call_id, tool_name, ..
                } = block
                else {
                    continue;
                };

                let canonical = state
                    .resolve(call_id)
                    .ok_or_else(|| HistoryError::UnknownToolCall {
                        call_id: call_id.clone(),
                    })?;

                if state.answered.contains(&canonical) || answered.contains(&canonical) {
                    return Err(HistoryError::DuplicateToolResponse { call_id: canonical });
                }

                if tool_name.trim().is_empty() {
                    if let Some(entry) = state.calls.get(&canonical) {
                        *tool_name = entry.name.clone();
                    }
                }
                *call_id = canonical.clone();
                answered.push(canonical);
            }
        }
        Speaker::Human => {}
    }

    Ok(PreparedAppend {
        record,
        new_calls,
        new_aliases,
        answered,
    })
}

/// Alias a native id, and its prefix-stripped canonical form, to `canonical`
fn push_native_alias(aliases: &mut Vec<(String, String)>, native: &str, canonical: &str) {
    if native.trim().is_empty() {
        return;
    }
    aliases.push((native.to_string(), canonical.to_string()));
    let stripped = ids::canonicalize(native);
    if stripped != canonical && stripped != native {
        aliases.push((stripped, canonical.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ai_with_call(raw_id: &str, name: &str) -> ContentRecord {
        ContentRecord::ai(vec![ContentBlock::tool_call(raw_id, name, json!({"path": "a.rs"}))])
            .unwrap()
            .with_provider("openai")
            .with_turn_id("turn-1")
    }

    #[test]
    fn test_raw_ids_are_canonicalized() {
        let history = HistoryService::new();
        history.append(ContentRecord::human("read a.rs")).unwrap();
        history.append(ai_with_call("call_raw1", "read_file")).unwrap();

        let expected = HistoryService::generate_canonical_id(
            "turn-1",
            0,
            "openai",
            Some("call_raw1"),
            "read_file",
        );
        assert_eq!(history.resolve_tool_id("call_raw1"), Some(expected.clone()));
        assert_eq!(history.resolve_tool_id(&expected), Some(expected.clone()));

        let records = history.records();
        assert!(matches!(&records[1].blocks[0], ContentBlock::ToolCall { id, .. } if *id == expected));
    }

    #[test]
    fn test_response_by_raw_id_fills_tool_name() {
        let history = HistoryService::new();
        history.append(ai_with_call("call_raw1", "read_file")).unwrap();

        let response = ContentRecord::tool(vec![ContentBlock::tool_response(
            "call_raw1",
            "",
            json!("fn main() {}"),
        )])
        .unwrap();
        history.append(response).unwrap();

        let records = history.records();
        match &records[1].blocks[0] {
            ContentBlock::ToolResponse {
                call_id, tool_name, ..
            } => {
                assert!(ids::is_canonical(call_id));
                assert_eq!(tool_name, "read_file");
            }
            other => panic!("unexpected block {:?}", other),
        }
        assert!(history.unanswered_tool_calls().is_empty());
    }

    fn canonical_call(id: &str, turn_id: &str) -> ContentRecord {
        ContentRecord::ai(vec![ContentBlock::tool_call(id, "grep", json!({}))])
            .unwrap()
            .with_turn_id(turn_id)
    }

    #[test]
    fn test_rejections_leave_history_untouched() {
        let history = HistoryService::new();
        history.append(canonical_call("hist_tool_abc", "turn-1")).unwrap();

        let unknown = ContentRecord::tool(vec![ContentBlock::tool_response(
            "hist_tool_missing",
            "grep",
            json!(""),
        )])
        .unwrap();
        assert!(matches!(
            history.append(unknown),
            Err(HistoryError::UnknownToolCall { .. })
        ));

        let duplicate = canonical_call("hist_tool_abc", "turn-1");
        assert!(matches!(
            history.append(duplicate),
            Err(HistoryError::DuplicateToolCall { .. })
        ));

        let twice = ContentRecord::tool(vec![
            ContentBlock::tool_response("hist_tool_abc", "grep", json!("1")),
            ContentBlock::tool_response("hist_tool_abc", "grep", json!("2")),
        ])
        .unwrap();
        assert!(matches!(
            history.append(twice),
            Err(HistoryError::DuplicateToolResponse { .. })
        ));

        assert_eq!(history.len(), 1);
        assert_eq!(history.unanswered_tool_calls().len(), 1);
    }

    #[test]
    fn test_same_record_repeating_an_id_is_rejected() {
        let history = HistoryService::new();
        let record = ContentRecord::ai(vec![
            ContentBlock::tool_call("hist_tool_abc", "grep", json!({})),
            ContentBlock::tool_call("hist_tool_abc", "grep", json!({})),
        ])
        .unwrap();
        assert!(matches!(
            history.append(record),
            Err(HistoryError::DuplicateToolCall { .. })
        ));
        assert!(history.is_empty());
    }

    #[test]
    fn test_id_reused_by_later_turn_is_rekeyed() {
        let history = HistoryService::new();
        history.append(canonical_call("hist_tool_0", "turn-1")).unwrap();
        history
            .append(ContentRecord::tool(vec![ContentBlock::tool_response("call_0", "", json!("a"))]).unwrap())
            .unwrap();
        history.append(ContentRecord::human("again")).unwrap();
        let index = history.append(canonical_call("hist_tool_0", "turn-2")).unwrap();

        let records = history.records();
        let ContentBlock::ToolCall { id: second, .. } = &records[index].blocks[0] else {
            panic!("expected a tool call");
        };
        assert_ne!(second, "hist_tool_0");
        assert_eq!(history.resolve_tool_id("call_0").as_deref(), Some(second.as_str()));
        assert_eq!(history.unanswered_tool_calls().len(), 1);

        history
            .append(ContentRecord::tool(vec![ContentBlock::tool_response("call_0", "", json!("b"))]).unwrap())
            .unwrap();
        assert!(history.unanswered_tool_calls().is_empty());
        assert_eq!(history.statistics().tool_calls, 2);
    }

    #[test]
    fn test_streamed_native_ids_resolve() {
        let history = HistoryService::new();
        let derived = ids::generate_canonical_id("turn-1", 0, "openai", Some("call_0"), "grep");
        let mut record = canonical_call(&derived, "turn-1");
        record
            .metadata
            .native_tool_ids
            .insert("call_0".to_string(), derived.clone());
        history.append(record).unwrap();

        assert_eq!(history.resolve_tool_id("call_0"), Some(derived.clone()));
        assert_eq!(history.resolve_tool_id("hist_tool_0"), Some(derived));
        assert_eq!(history.resolve_tool_id(""), None);
    }

    #[test]
    fn test_token_events_only_on_change() {
        let history = HistoryService::new();
        let mut events = history.subscribe();

        history.append(ContentRecord::human("12345678")).unwrap();
        history
            .append(ContentRecord::ai(Vec::new()).unwrap())
            .unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            HistoryEvent::RecordAppended {
                index: 0,
                speaker: Speaker::Human
            }
        );
        assert_eq!(events.try_recv().unwrap(), HistoryEvent::TokensUpdated { total: 2 });
        assert_eq!(
            events.try_recv().unwrap(),
            HistoryEvent::RecordAppended {
                index: 1,
                speaker: Speaker::Ai
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_curated_drops_filler_only() {
        let history = HistoryService::new();
        history.append(ContentRecord::human("hi")).unwrap();
        history
            .append(ContentRecord::ai(vec![ContentBlock::text("  ")]).unwrap())
            .unwrap();
        history.append(ai_with_call("call_x", "ls")).unwrap();

        let curated = history.get_curated();
        assert_eq!(curated.len(), 2);
        assert_eq!(history.statistics().ai_records, 2);
        assert_eq!(history.statistics().unanswered_tool_calls, 1);
    }

    #[test]
    fn test_clear_resets_everything() {
        let history = HistoryService::new();
        history.append(ai_with_call("call_x", "ls")).unwrap();
        history.clear();

        assert!(history.is_empty());
        assert_eq!(history.total_tokens(), 0);
        assert_eq!(history.resolve_tool_id("call_x"), None);
    }
}
