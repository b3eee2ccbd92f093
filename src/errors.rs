// Error taxonomy for the provider runtime
//
// Each concern owns one enum. Credential and validation failures always reach
// the caller; transport retries stay inside the adapters and only exhaustion
// is surfaced. Cancellation is not an error and has no variant here.

use std::path::PathBuf;

use thiserror::Error;

/// Content model invariant violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("tool record must contain at least one tool_response block")]
    ToolRecordWithoutResponse,

    #[error("tool_response blocks are only allowed in tool records (found in {speaker} record)")]
    MisplacedToolResponse { speaker: String },

    #[error("tool_call blocks are only allowed in ai records (found in {speaker} record)")]
    MisplacedToolCall { speaker: String },

    #[error("tool_call block has an empty id")]
    EmptyToolCallId,

    #[error("tool_response block has an empty call id")]
    EmptyResponseCallId,
}

/// History engine failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("tool response references unknown tool call '{call_id}'")]
    UnknownToolCall { call_id: String },

    #[error("tool call id '{id}' is already present in the conversation")]
    DuplicateToolCall { id: String },

    #[error("tool call '{call_id}' already has a response")]
    DuplicateToolResponse { call_id: String },
}

/// Wire <-> universal conversion failures
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("unsupported {backend} role '{role}'")]
    UnsupportedRole { backend: &'static str, role: String },

    #[error("{backend} message has no convertible content")]
    EmptyMessage { backend: &'static str },

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A single failed settings check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Settings repository (persistence collaborator) failures
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("settings I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("settings watcher failed: {0}")]
    Watch(String),

    #[error("settings save rejected: {0}")]
    Rejected(String),
}

/// Settings store failures
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings for '{scope}': {}", join_issues(.issues))]
    Validation {
        scope: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("failed to persist settings after {attempts} attempt(s): {message}")]
    Persistence { attempts: u32, message: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl SettingsError {
    pub fn validation(scope: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self::Validation {
            scope: scope.into(),
            issues,
        }
    }
}

/// Credential resolution failures
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read keyfile {path}: {source}")]
    Keyfile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("OAuth for '{provider}' failed: {message}")]
    OAuth { provider: String, message: String },
}

/// Provider adapter failures
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no credentials available for provider '{provider}'")]
    Unauthorized { provider: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{provider} request failed after {attempts} attempt(s) (status {status}): {body}")]
    RetryExhausted {
        provider: String,
        attempts: u32,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed (status {status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} transport error: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} stream error: {message}")]
    Stream { provider: String, message: String },

    #[error("{provider} stream stalled for {seconds}s")]
    StreamTimeout { provider: String, seconds: u64 },

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("no provider is selected and none is enabled")]
    NoActiveProvider,
}

impl ProviderError {
    /// Whether the UI should treat this as a prompt to (re)enter credentials
    pub fn is_auth_error(&self) -> bool {
        match self {
            ProviderError::Unauthorized { .. } | ProviderError::Auth(_) => true,
            ProviderError::Http { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// Short actionable hint for display alongside the error
    pub fn user_hint(&self) -> Option<String> {
        match self {
            ProviderError::Unauthorized { provider } => Some(format!(
                "Set an API key for '{provider}' (apiKey or apiKeyfile in its settings, \
                 or the provider's environment variable), or log in with OAuth if it is supported."
            )),
            ProviderError::Http { provider, status, .. } if matches!(status, 401 | 403) => {
                Some(format!(
                    "The {provider} API rejected the credentials. Check that the key has not been revoked."
                ))
            }
            ProviderError::RetryExhausted { provider, .. } => Some(format!(
                "{provider} is rate limiting or unavailable. Wait a moment, or raise 'retries' in its settings."
            )),
            ProviderError::Settings(SettingsError::Validation { scope, .. }) => Some(format!(
                "Fix the settings for '{scope}' before using it."
            )),
            _ => None,
        }
    }
}

/// Failures while driving a single turn
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to record the response: {0}")]
    History(#[from] HistoryError),
}
