// Credential precedence resolution
//
// Sources are tried in a fixed order: explicit key, keyfile, environment,
// then OAuth. OAuth is only consulted when the caller opts in, which only the
// model invocation path does. Configuration-time callers can resolve as often
// as they like without ever starting a login.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BackendKind;
use crate::errors::AuthError;
use crate::settings::{ProviderSettings, SettingsStore};

pub mod keyfile;

pub use keyfile::KeyfileReader;

/// Looks up an environment variable; swappable for tests
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Where a resolved credential came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSource {
    ApiKey,
    Keyfile,
    Environment(String),
    OAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    pub token: String,
    pub source: AuthSource,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResolvedToken {
    pub fn is_oauth(&self) -> bool {
        self.source == AuthSource::OAuth
    }
}

/// Per-call resolution options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Allow the OAuth source. Off by default.
    pub include_oauth: bool,
}

impl ResolveOptions {
    /// Profile load, provider switch, settings edits, model listing
    pub fn configuration() -> Self {
        Self {
            include_oauth: false,
        }
    }

    /// Actual model calls
    pub fn invocation() -> Self {
        Self {
            include_oauth: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// External OAuth collaborator
///
/// `token` may run an interactive login. The resolver never calls it unless
/// the caller passed `include_oauth`.
#[async_trait]
pub trait OAuthManager: Send + Sync {
    fn supports(&self, provider: BackendKind) -> bool;

    async fn is_enabled(&self, provider: BackendKind) -> bool;

    async fn token(&self, provider: BackendKind) -> Result<Option<OAuthToken>, AuthError>;

    async fn logout(&self, provider: BackendKind) -> Result<(), AuthError>;
}

struct CacheEntry {
    token: ResolvedToken,
    fingerprint: String,
    valid_until: Instant,
}

/// Resolves credentials for backends, with a short-lived cache
pub struct AuthPrecedenceResolver {
    settings: Arc<SettingsStore>,
    oauth: Option<Arc<dyn OAuthManager>>,
    cache: DashMap<BackendKind, CacheEntry>,
    inflight: DashMap<BackendKind, Arc<tokio::sync::Mutex<()>>>,
    ttl: Duration,
    env: EnvLookup,
    keyfile_reader: KeyfileReader,
}

impl AuthPrecedenceResolver {
    pub fn new(settings: Arc<SettingsStore>, ttl: Duration) -> Self {
        Self {
            settings,
            oauth: None,
            cache: DashMap::new(),
            inflight: DashMap::new(),
            ttl,
            env: Arc::new(|name: &str| std::env::var(name).ok()),
            keyfile_reader: keyfile::default_reader(),
        }
    }

    pub fn with_oauth(mut self, manager: Arc<dyn OAuthManager>) -> Self {
        self.oauth = Some(manager);
        self
    }

    pub fn with_env_lookup(mut self, lookup: EnvLookup) -> Self {
        self.env = lookup;
        self
    }

    pub fn with_keyfile_reader(mut self, reader: KeyfileReader) -> Self {
        self.keyfile_reader = reader;
        self
    }

    pub fn oauth_manager(&self) -> Option<&Arc<dyn OAuthManager>> {
        self.oauth.as_ref()
    }

    /// Resolve the credential for `provider` from its current settings
    ///
    /// Returns `Ok(None)` when no source yields a token. Keyfile and OAuth
    /// failures are errors.
    pub async fn resolve(
        &self,
        provider: BackendKind,
        options: ResolveOptions,
    ) -> Result<Option<ResolvedToken>, AuthError> {
        let settings = self.settings.provider(provider).await;
        let fingerprint = fingerprint(&settings);

        if let Some(hit) = self.cached(provider, &fingerprint, options) {
            return Ok(Some(hit));
        }

        // One resolution per backend at a time so OAuth never runs twice
        let gate = self
            .inflight
            .entry(provider)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if let Some(hit) = self.cached(provider, &fingerprint, options) {
            return Ok(Some(hit));
        }

        let resolved = self.resolve_uncached(provider, &settings, options).await?;
        if let Some(token) = &resolved {
            self.store(provider, token, fingerprint);
        }
        Ok(resolved)
    }

    /// Just the token string
    pub async fn resolve_token(
        &self,
        provider: BackendKind,
        options: ResolveOptions,
    ) -> Result<Option<String>, AuthError> {
        Ok(self.resolve(provider, options).await?.map(|resolved| resolved.token))
    }

    pub fn invalidate(&self, provider: BackendKind) {
        if self.cache.remove(&provider).is_some() {
            tracing::debug!(provider = %provider, "auth cache entry invalidated");
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Drop cached credentials and sign out of OAuth for `provider`
    pub async fn logout(&self, provider: BackendKind) -> Result<(), AuthError> {
        self.invalidate(provider);
        if let Some(oauth) = &self.oauth {
            if oauth.supports(provider) {
                oauth.logout(provider).await?;
            }
        }
        Ok(())
    }

    fn cached(
        &self,
        provider: BackendKind,
        fingerprint: &str,
        options: ResolveOptions,
    ) -> Option<ResolvedToken> {
        let entry = self.cache.get(&provider)?;
        if entry.fingerprint != fingerprint || Instant::now() >= entry.valid_until {
            drop(entry);
            self.cache.remove(&provider);
            return None;
        }
        if entry.token.is_oauth() && !options.include_oauth {
            return None;
        }
        Some(entry.token.clone())
    }

    fn store(&self, provider: BackendKind, token: &ResolvedToken, fingerprint: String) {
        let mut ttl = self.ttl;
        if let Some(expires_at) = token.expires_at {
            let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            ttl = ttl.min(remaining);
        }
        if ttl.is_zero() {
            return;
        }
        self.cache.insert(
            provider,
            CacheEntry {
                token: token.clone(),
                fingerprint,
                valid_until: Instant::now() + ttl,
            },
        );
    }

    async fn resolve_uncached(
        &self,
        provider: BackendKind,
        settings: &ProviderSettings,
        options: ResolveOptions,
    ) -> Result<Option<ResolvedToken>, AuthError> {
        if settings.is_auth_only() {
            return self.oauth_token(provider, settings, options).await;
        }

        if let Some(key) = settings.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Ok(Some(static_token(key, AuthSource::ApiKey)));
            }
        }

        if let Some(path) = settings.api_keyfile.as_deref() {
            if !path.trim().is_empty() {
                let path = keyfile::expand_home(path);
                let contents = keyfile::read_blocking(&self.keyfile_reader, &path)
                    .await
                    .map_err(|source| AuthError::Keyfile {
                        path: path.clone(),
                        source,
                    })?;
                if let Some(key) = keyfile::parse_key(&contents) {
                    return Ok(Some(static_token(&key, AuthSource::Keyfile)));
                }
                tracing::warn!(provider = %provider, "keyfile {} is empty", path.display());
            }
        }

        for var in provider.env_vars() {
            if let Some(value) = (self.env)(var) {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(Some(static_token(value, AuthSource::Environment(var.to_string()))));
                }
            }
        }

        self.oauth_token(provider, settings, options).await
    }

    async fn oauth_token(
        &self,
        provider: BackendKind,
        settings: &ProviderSettings,
        options: ResolveOptions,
    ) -> Result<Option<ResolvedToken>, AuthError> {
        if !options.include_oauth || settings.oauth_enabled == Some(false) {
            return Ok(None);
        }
        let Some(oauth) = &self.oauth else {
            return Ok(None);
        };
        if !oauth.supports(provider) || !oauth.is_enabled(provider).await {
            return Ok(None);
        }

        tracing::debug!(provider = %provider, "resolving OAuth token");
        let token = oauth.token(provider).await?;
        Ok(token.map(|token| ResolvedToken {
            token: token.access_token,
            source: AuthSource::OAuth,
            expires_at: token.expires_at,
        }))
    }
}

fn static_token(token: &str, source: AuthSource) -> ResolvedToken {
    ResolvedToken {
        token: token.to_string(),
        source,
        expires_at: None,
    }
}

/// Hash of the settings that decide which credential wins
fn fingerprint(settings: &ProviderSettings) -> String {
    let mut hasher = Sha256::new();
    for part in [
        settings.api_key.as_deref(),
        settings.api_keyfile.as_deref(),
        settings.base_url.as_deref(),
    ] {
        match part {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    hasher.update([settings.is_auth_only() as u8]);
    hasher.update([settings.oauth_enabled.map_or(2, u8::from)]);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
