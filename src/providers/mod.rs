// Provider adapters
//
// One adapter per wire family turns the universal history into backend
// requests and backend streams back into universal deltas. Callers only see
// the `Provider` trait.

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use crate::config::BackendKind;
use crate::content::ContentRecord;
use crate::converters::stream::DeltaMerger;
use crate::errors::ProviderError;
use crate::history::ThinkingPolicy;

pub mod base;
pub mod retry;
pub mod sse;
pub mod tool_format;
pub mod types;

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub mod manager;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use manager::{create_provider, ProviderManager};
pub use openai::OpenAIProvider;
pub use retry::RetryPolicy;
pub use tool_format::ToolFormat;
pub use types::{CompletionRequest, ModelInfo, ToolDefinition};

/// Partial assistant records for one response
///
/// Finite and not restartable. Closes without an error on cancellation.
pub type DeltaStream = Receiver<Result<ContentRecord, ProviderError>>;

/// A backend integration
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name as used in settings (e.g. "openai", "anthropic")
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Model used when a request does not name one
    async fn default_model(&self) -> String;

    /// Models offered by the backend
    ///
    /// Never starts an OAuth flow. Without credentials this is the built-in list.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// Stream a response as partial records
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ProviderError>;

    /// Collect the whole stream into one record
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ContentRecord, ProviderError> {
        let mut stream = self.stream_completion(request, cancel).await?;
        let mut merger = DeltaMerger::new();
        while let Some(delta) = stream.recv().await {
            merger.push(&delta?);
        }
        Ok(merger.finish().with_provider(self.name()))
    }

    fn supports_oauth(&self) -> bool {
        self.kind().supports_oauth()
    }

    /// Which thinking blocks the backend should be sent
    fn thinking_policy(&self) -> ThinkingPolicy {
        ThinkingPolicy::CurrentTurn
    }
}
