// Switchboard - multi-backend LLM provider runtime
// Library exports

pub mod auth; // Credential precedence and caching
pub mod config; // Runtime config and backend catalogue
pub mod content; // Universal content model
pub mod converters; // Wire format <-> universal content
pub mod errors;
pub mod history; // Conversation history and curation
pub mod providers; // Backend adapters
pub mod runtime;
pub mod settings; // Persisted provider settings
pub mod turn;

pub use config::BackendKind;
pub use content::{ContentBlock, ContentRecord, Speaker};
pub use errors::{ProviderError, SettingsError};
pub use history::HistoryService;
pub use providers::{CompletionRequest, Provider, ProviderManager};
pub use runtime::RuntimeContext;
pub use settings::SettingsStore;
pub use turn::{run_turn, TurnOutcome};
