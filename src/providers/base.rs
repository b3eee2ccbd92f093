// Shared adapter plumbing
//
// Every adapter owns a `ProviderBase`: settings access, credential lookup,
// model resolution, retried sends and SSE stream spawning.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::retry::{self, AttemptError, RetryOutcome, RetryPolicy};
use super::sse::{self, StreamDecoder};
use super::types::{CompletionRequest, ModelInfo};
use super::DeltaStream;
use crate::auth::{AuthPrecedenceResolver, ResolveOptions, ResolvedToken};
use crate::config::BackendKind;
use crate::content::{ContentRecord, RecordMetadata, Speaker, Usage};
use crate::errors::ProviderError;
use crate::runtime::RuntimeContext;
use crate::settings::{ProviderSettings, SettingsStore};

pub struct ProviderBase {
    kind: BackendKind,
    settings: Arc<SettingsStore>,
    auth: Arc<AuthPrecedenceResolver>,
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl ProviderBase {
    pub fn new(kind: BackendKind, ctx: &RuntimeContext) -> Self {
        Self {
            kind,
            settings: Arc::clone(&ctx.settings),
            auth: Arc::clone(&ctx.auth),
            client: ctx.http.clone(),
            idle_timeout: ctx.config.stream_idle_timeout(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn settings(&self) -> ProviderSettings {
        self.settings.provider(self.kind).await
    }

    /// Configured endpoint without a trailing slash
    pub fn base_url(&self, settings: &ProviderSettings) -> String {
        settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(self.kind.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Explicit request model, then the `model` setting, then the backend default
    pub fn resolve_model(&self, request: &CompletionRequest, settings: &ProviderSettings) -> String {
        let named = |model: &Option<String>| model.clone().filter(|m| !m.trim().is_empty());
        named(&request.model)
            .or_else(|| named(&settings.model))
            .unwrap_or_else(|| self.kind.default_model().to_string())
    }

    pub fn default_model(&self, settings: &ProviderSettings) -> String {
        self.resolve_model(&CompletionRequest::default(), settings)
    }

    /// Credential for a model call; OAuth is allowed here
    pub async fn require_token(&self) -> Result<ResolvedToken, ProviderError> {
        self.auth
            .resolve(self.kind, ResolveOptions::invocation())
            .await?
            .ok_or_else(|| ProviderError::Unauthorized {
                provider: self.name().to_string(),
            })
    }

    /// Credential for a model call to a backend that may run without one
    pub async fn optional_token(&self) -> Result<Option<ResolvedToken>, ProviderError> {
        Ok(self
            .auth
            .resolve(self.kind, ResolveOptions::invocation())
            .await?)
    }

    /// Credential for configuration-time work; never starts an OAuth flow
    pub async fn probe_token(&self) -> Result<Option<ResolvedToken>, ProviderError> {
        Ok(self
            .auth
            .resolve(self.kind, ResolveOptions::configuration())
            .await?)
    }

    pub fn retry_policy(&self, settings: &ProviderSettings) -> RetryPolicy {
        RetryPolicy::from_settings(settings)
    }

    /// Send a request with retries on 429/5xx
    ///
    /// `build` is called once per attempt. Returns `None` when cancelled.
    pub async fn send<F>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<Option<reqwest::Response>, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let provider = self.name();
        let outcome = retry::with_retry(provider, policy, cancel, |attempt| {
            let request = build();
            async move {
                tracing::debug!(provider, attempt, "sending request");
                let response = request.send().await.map_err(|e| {
                    AttemptError::Fatal(ProviderError::Transport {
                        provider: provider.to_string(),
                        source: e,
                    })
                })?;

                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let retry_after = retry::parse_retry_after(response.headers());
                let body = response.text().await.unwrap_or_default();
                Err(AttemptError::Status {
                    status: status.as_u16(),
                    body,
                    retry_after,
                })
            }
        })
        .await?;

        match outcome {
            RetryOutcome::Completed { value, retries } => {
                if retries > 0 {
                    tracing::info!(provider, retries, "request succeeded after retries");
                }
                Ok(Some(value))
            }
            RetryOutcome::Cancelled => Ok(None),
        }
    }

    /// Send and stream; a cancelled send yields an already-closed stream
    pub async fn stream<F, D>(
        &self,
        policy: &RetryPolicy,
        cancel: CancellationToken,
        build: F,
        decoder: D,
    ) -> Result<DeltaStream, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder,
        D: StreamDecoder + 'static,
    {
        match self.send(policy, &cancel, build).await? {
            Some(response) => Ok(sse::spawn_stream(
                self.name(),
                response,
                decoder,
                cancel,
                self.idle_timeout,
            )),
            None => {
                let (_, rx) = tokio::sync::mpsc::channel(1);
                Ok(rx)
            }
        }
    }

    /// Model list from the backend, or the built-in list when that is not possible
    ///
    /// Uses configuration-time credentials only. Self-hosted backends are
    /// queried even without a credential.
    pub async fn list_models_with<F, Fut>(&self, fetch: F) -> Result<Vec<ModelInfo>, ProviderError>
    where
        F: FnOnce(Option<ResolvedToken>, ProviderSettings) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<ModelInfo>, ProviderError>>,
    {
        let settings = self.settings().await;
        let token = self.probe_token().await?;
        if token.is_none() && !self.kind.requires_endpoint() {
            tracing::debug!(provider = self.name(), "no credentials, using built-in model list");
            return Ok(self.fallback_models());
        }

        match fetch(token, settings).await {
            Ok(models) if !models.is_empty() => Ok(models),
            Ok(_) => Ok(self.fallback_models()),
            Err(e) => {
                tracing::warn!(provider = self.name(), "model listing failed: {}", e);
                Ok(self.fallback_models())
            }
        }
    }

    pub fn transport(&self, source: reqwest::Error) -> ProviderError {
        ProviderError::Transport {
            provider: self.name().to_string(),
            source,
        }
    }

    pub fn fallback_models(&self) -> Vec<ModelInfo> {
        self.kind
            .fallback_models()
            .iter()
            .map(|id| ModelInfo::new(*id))
            .collect()
    }
}

/// Turn key mixed into streamed tool call ids; fresh when the caller set none
pub fn turn_key(request: &CompletionRequest) -> String {
    request
        .turn_id
        .clone()
        .filter(|turn_id| !turn_id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// A metadata-only delta naming the model and, when reported, token usage
pub fn metadata_delta(model: &str, usage: Option<Usage>) -> ContentRecord {
    ContentRecord {
        speaker: Speaker::Ai,
        blocks: Vec::new(),
        metadata: RecordMetadata {
            model: Some(model.to_string()),
            usage,
            ..RecordMetadata::default()
        },
    }
}

/// Non-success status as a `ProviderError`, for plain (non-retried) calls
pub async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        provider: provider.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Parse one SSE payload, surfacing an embedded error object as a stream error
pub fn decode_payload(provider: &str, data: &str) -> Result<serde_json::Value, ProviderError> {
    let value: serde_json::Value =
        serde_json::from_str(data).map_err(|e| ProviderError::Stream {
            provider: provider.to_string(),
            message: format!("malformed event: {}", e),
        })?;
    if let Some(message) = stream_error_message(&value) {
        tracing::error!(provider, "stream reported an error: {}", message);
        return Err(ProviderError::Stream {
            provider: provider.to_string(),
            message,
        });
    }
    Ok(value)
}

/// Deserialize a parsed payload into a typed event
pub fn typed_payload<T: serde::de::DeserializeOwned>(
    provider: &str,
    value: serde_json::Value,
) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::Stream {
        provider: provider.to_string(),
        message: format!("unexpected event shape: {}", e),
    })
}

/// Error message from a JSON error payload embedded in a stream
pub fn stream_error_message(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    Some(
        error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}
