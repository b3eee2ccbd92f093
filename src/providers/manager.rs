// Provider manager
//
// Builds an adapter per built-in backend and resolves which one is active.
// Switching goes through the settings store and never starts an OAuth flow.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::anthropic::AnthropicProvider;
use super::gemini::GeminiProvider;
use super::openai::OpenAIProvider;
use super::Provider;
use crate::config::BackendKind;
use crate::errors::ProviderError;
use crate::runtime::RuntimeContext;

/// Adapter for `kind`
pub fn create_provider(kind: BackendKind, ctx: &RuntimeContext) -> Arc<dyn Provider> {
    match kind {
        BackendKind::OpenAI | BackendKind::Qwen | BackendKind::Local => {
            Arc::new(OpenAIProvider::new(kind, ctx))
        }
        BackendKind::Anthropic => Arc::new(AnthropicProvider::new(ctx)),
        BackendKind::Gemini => Arc::new(GeminiProvider::new(ctx)),
    }
}

pub struct ProviderManager {
    ctx: RuntimeContext,
    providers: BTreeMap<BackendKind, Arc<dyn Provider>>,
}

impl ProviderManager {
    pub fn new(ctx: &RuntimeContext) -> Self {
        let providers = BackendKind::ALL
            .iter()
            .map(|kind| (*kind, create_provider(*kind, ctx)))
            .collect();
        Self {
            ctx: ctx.clone(),
            providers,
        }
    }

    /// Replace the adapter for its backend
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        BackendKind::from_name(name)
            .and_then(|kind| self.get(kind))
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.values()
    }

    /// The `defaultProvider`, else the first enabled backend
    pub async fn active(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(kind) = self.ctx.settings.default_provider().await {
            if let Some(provider) = self.get(kind) {
                return Ok(provider);
            }
        }

        let snapshot = self.ctx.settings.snapshot().await;
        BackendKind::ALL
            .iter()
            .find(|kind| {
                snapshot
                    .providers
                    .get(kind.name())
                    .is_some_and(|settings| settings.enabled)
            })
            .and_then(|kind| self.get(*kind))
            .ok_or(ProviderError::NoActiveProvider)
    }

    /// Make `name` the default provider
    ///
    /// Validation failures leave settings untouched. Credentials are only
    /// probed without OAuth, to warn early when none are configured.
    pub async fn switch_provider(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let provider = self.get_by_name(name)?;
        self.ctx.settings.switch_provider(provider.name()).await?;
        self.ctx.auth.invalidate(provider.kind());

        let probe = self
            .ctx
            .auth
            .resolve(provider.kind(), crate::auth::ResolveOptions::configuration())
            .await;
        match probe {
            Ok(Some(_)) => {}
            Ok(None) if provider.supports_oauth() => tracing::info!(
                provider = provider.name(),
                "no stored credentials; OAuth will be used on first request if enabled"
            ),
            Ok(None) if !provider.kind().requires_endpoint() => tracing::warn!(
                provider = provider.name(),
                "no credentials configured"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(provider = provider.name(), "credential check failed: {}", e),
        }

        Ok(provider)
    }
}
