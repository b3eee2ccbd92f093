// Turn driver
//
// One model turn: curate history for the active backend, stream the response
// to a callback, then append the merged assistant record to history.

use tokio_util::sync::CancellationToken;

use crate::content::ContentRecord;
use crate::converters::stream::DeltaMerger;
use crate::errors::TurnError;
use crate::history::{CurationOptions, HistoryService};
use crate::providers::{CompletionRequest, Provider};

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Index of the appended record, if anything was produced
    pub index: Option<usize>,
    pub record: Option<ContentRecord>,
    pub cancelled: bool,
}

/// Run one turn against `provider`
///
/// `request` supplies model, system prompt and tools; its contents are
/// replaced with the curated history. A cancelled turn keeps whatever text
/// already arrived. Stream errors leave history unchanged.
pub async fn run_turn<F>(
    history: &HistoryService,
    provider: &dyn Provider,
    mut request: CompletionRequest,
    cancel: CancellationToken,
    mut on_delta: F,
) -> Result<TurnOutcome, TurnError>
where
    F: FnMut(&ContentRecord) + Send,
{
    let turn_id = uuid::Uuid::new_v4().to_string();
    request.contents =
        history.get_curated_for_provider(&CurationOptions::with_thinking(provider.thinking_policy()));
    request.turn_id = Some(turn_id.clone());

    let model = match request.model.clone() {
        Some(model) => model,
        None => provider.default_model().await,
    };

    tracing::info!(
        provider = provider.name(),
        model = %model,
        turn = %turn_id,
        records = request.contents.len(),
        "starting turn"
    );

    let mut stream = provider.stream_completion(request, cancel.clone()).await?;
    let mut merger = DeltaMerger::new();
    while let Some(delta) = stream.recv().await {
        let delta = delta?;
        on_delta(&delta);
        merger.push(&delta);
    }

    let cancelled = cancel.is_cancelled();
    let mut record = merger.finish().with_provider(provider.name()).with_turn_id(&turn_id);
    if record.metadata.model.is_none() {
        record.metadata.model = Some(model);
    }
    record.metadata.created_at = Some(chrono::Utc::now());

    if record.is_empty_filler() {
        tracing::debug!(turn = %turn_id, cancelled, "turn produced no content");
        return Ok(TurnOutcome {
            index: None,
            record: None,
            cancelled,
        });
    }

    let index = history.append(record.clone())?;
    tracing::debug!(turn = %turn_id, index, cancelled, "turn recorded");

    // The stored record carries canonical ids; hand that version back
    Ok(TurnOutcome {
        index: Some(index),
        record: history.record(index).or(Some(record)),
        cancelled,
    })
}
